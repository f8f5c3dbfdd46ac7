//! Bounded, ordered answer event stream for streaming consumers.
//!
//! The pipeline models streamed answers as a bounded buffer of ordered
//! [`AnswerEvent`]s drained by a single reader, with explicit close and
//! backpressure accounting instead of generator `.close()` semantics.
//!
//! # Event contract
//!
//! Per answer, the sequence is: one [`AnswerEvent::Started`] marker, zero or
//! more [`AnswerEvent::Content`] events carrying a strictly increasing index,
//! one [`AnswerEvent::Sources`] event, then exactly one terminal event —
//! [`AnswerEvent::Done`] or [`AnswerEvent::Error`]. The stream assigns
//! content indices itself, so index order holds by construction; the terminal
//! event closes the stream and later publishes are rejected.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Candidate, QualityFlag};

/// Default bounded capacity for answer streams.
pub const DEFAULT_ANSWER_STREAM_CAPACITY: usize = 256;

/// One event in a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnswerEvent {
    /// Stream start marker.
    Started {
        /// Opaque identifier correlating all events of one answer.
        query_id: String,
    },
    /// One incremental chunk of answer text.
    Content {
        /// Strictly increasing chunk index, starting at 0.
        index: u64,
        /// The text chunk.
        text: String,
    },
    /// The evidence the answer is grounded on.
    Sources {
        /// Evidence candidates in rerank order.
        evidence: Vec<Candidate>,
    },
    /// Terminal success event; always the last event of a stream.
    Done {
        /// Number of content chunks emitted.
        total_chunks: u64,
        /// Tokens consumed by generation.
        tokens_used: u64,
        /// End-to-end elapsed time in milliseconds.
        elapsed_ms: u64,
        /// Honest quality labeling of the streamed answer.
        quality: QualityFlag,
    },
    /// Terminal failure event; always the last event of a stream.
    Error {
        /// Stable machine-readable reason code.
        reason_code: String,
        /// Human-readable message.
        message: String,
        /// Remediation hints for the consumer.
        hints: Vec<String>,
    },
}

impl AnswerEvent {
    /// Whether this event terminates the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Bounded-buffer policy for the answer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStreamMode {
    /// Drop the oldest queued event when full; never block the producer.
    Lossy,
    /// Reject new events when full; the producer must handle backpressure.
    NonLossy,
}

/// Configuration for [`AnswerStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerStreamConfig {
    /// Maximum number of queued events.
    pub capacity: usize,
    /// Backpressure/drop policy. Non-lossy is the default: dropping content
    /// chunks corrupts the reconstructed answer.
    pub mode: AnswerStreamMode,
}

impl Default for AnswerStreamConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ANSWER_STREAM_CAPACITY,
            mode: AnswerStreamMode::NonLossy,
        }
    }
}

impl AnswerStreamConfig {
    /// Validate stream configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if capacity is zero.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.capacity == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "answer_stream.capacity".to_owned(),
                value: self.capacity.to_string(),
                reason: "must be >= 1 for bounded buffering".to_owned(),
            });
        }
        Ok(())
    }
}

/// A buffered answer frame with drop accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerFrame {
    /// Monotonic sequence number across all events of this stream.
    pub sequence: u64,
    /// Number of events dropped since the prior emitted frame (lossy mode).
    pub dropped_since_last: u64,
    /// The event payload.
    pub event: AnswerEvent,
}

/// Point-in-time stream health counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerStreamHealth {
    /// Configured buffering mode.
    pub mode: AnswerStreamMode,
    /// Maximum buffer capacity.
    pub capacity: usize,
    /// Current queued frame count.
    pub buffered: usize,
    /// Total successfully emitted frames.
    pub emitted_total: u64,
    /// Total dropped frames (lossy mode only).
    pub dropped_total: u64,
    /// Total rejected publishes due to a full buffer (non-lossy mode).
    pub backpressure_rejections: u64,
    /// Whether a terminal event has closed the stream.
    pub closed: bool,
}

/// Bounded answer event stream with explicit close and drop/backpressure
/// accounting.
///
/// Intentionally synchronous and lightweight so pipeline code can publish
/// events without async runtime coupling; a transport layer drains frames
/// with [`AnswerStream::drain`].
#[derive(Debug)]
pub struct AnswerStream {
    config: AnswerStreamConfig,
    queue: Mutex<VecDeque<AnswerFrame>>,
    next_sequence: AtomicU64,
    next_content_index: AtomicU64,
    closed: AtomicBool,
    emitted_total: AtomicU64,
    dropped_total: AtomicU64,
    backpressure_rejections: AtomicU64,
    pending_dropped_since_last: AtomicU64,
}

impl Default for AnswerStream {
    fn default() -> Self {
        Self {
            config: AnswerStreamConfig::default(),
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(0),
            next_content_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            emitted_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            pending_dropped_since_last: AtomicU64::new(0),
        }
    }
}

impl AnswerStream {
    /// Create a stream with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` is invalid.
    pub fn new(config: AnswerStreamConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Publish the stream start marker.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamClosed`] after a terminal event, or
    /// [`PipelineError::QueueFull`] in non-lossy mode when the buffer is full.
    pub fn start(&self, query_id: impl Into<String>) -> PipelineResult<()> {
        self.publish(AnswerEvent::Started {
            query_id: query_id.into(),
        })
    }

    /// Publish one content chunk, assigning the next index.
    ///
    /// Returns the assigned index.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamClosed`] after a terminal event, or
    /// [`PipelineError::QueueFull`] in non-lossy mode when the buffer is full.
    pub fn content(&self, text: impl Into<String>) -> PipelineResult<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::StreamClosed {
                rejected: "content".to_owned(),
            });
        }
        let index = self.next_content_index.fetch_add(1, Ordering::Relaxed);
        self.publish(AnswerEvent::Content {
            index,
            text: text.into(),
        })?;
        Ok(index)
    }

    /// Publish the evidence/sources event.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamClosed`] after a terminal event, or
    /// [`PipelineError::QueueFull`] in non-lossy mode when the buffer is full.
    pub fn sources(&self, evidence: Vec<Candidate>) -> PipelineResult<()> {
        self.publish(AnswerEvent::Sources { evidence })
    }

    /// Publish the terminal success event and close the stream.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamClosed`] if already closed.
    pub fn done(
        &self,
        tokens_used: u64,
        elapsed_ms: u64,
        quality: QualityFlag,
    ) -> PipelineResult<()> {
        let total_chunks = self.next_content_index.load(Ordering::Relaxed);
        self.publish(AnswerEvent::Done {
            total_chunks,
            tokens_used,
            elapsed_ms,
            quality,
        })
    }

    /// Publish the terminal error event and close the stream.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StreamClosed`] if already closed.
    pub fn error(&self, error: &PipelineError) -> PipelineResult<()> {
        self.publish(AnswerEvent::Error {
            reason_code: error.reason_code().to_owned(),
            message: error.to_string(),
            hints: error
                .remediation_hints()
                .into_iter()
                .map(str::to_owned)
                .collect(),
        })
    }

    /// Whether a terminal event has closed the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drain up to `max_items` frames from oldest to newest.
    #[must_use]
    pub fn drain(&self, max_items: usize) -> Vec<AnswerFrame> {
        if max_items == 0 {
            return Vec::new();
        }
        let mut queue = self.lock_queue();
        let take = max_items.min(queue.len());
        let mut drained = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(frame) = queue.pop_front() {
                drained.push(frame);
            }
        }
        drained
    }

    /// Snapshot stream health counters.
    #[must_use]
    pub fn health(&self) -> AnswerStreamHealth {
        let buffered = self.lock_queue().len();
        AnswerStreamHealth {
            mode: self.config.mode,
            capacity: self.config.capacity,
            buffered,
            emitted_total: self.emitted_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<AnswerFrame>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, event: AnswerEvent) -> PipelineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::StreamClosed {
                rejected: format!("{event:?}"),
            });
        }

        let terminal = event.is_terminal();
        let mut queue = self.lock_queue();
        if queue.len() >= self.config.capacity {
            match self.config.mode {
                AnswerStreamMode::Lossy => {
                    let _ = queue.pop_front();
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    self.pending_dropped_since_last
                        .fetch_add(1, Ordering::Relaxed);
                }
                AnswerStreamMode::NonLossy => {
                    self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::QueueFull {
                        pending: queue.len(),
                        capacity: self.config.capacity,
                    });
                }
            }
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let dropped_since_last = self.pending_dropped_since_last.swap(0, Ordering::Relaxed);
        queue.push_back(AnswerFrame {
            sequence,
            dropped_since_last,
            event,
        });
        self.emitted_total.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        if terminal {
            self.closed.store(true, Ordering::Release);
        }
        Ok(())
    }
}
