//! History events
//!
//! Runtime changes are recorded as typed events, buffered per command by the
//! [`HistorySession`] and handed to the configured [`HistorySink`] only after
//! the command's transaction committed. A rolled back command leaves no history.

use crate::command::context;
use crate::command::session::Session;
use crate::command::transaction::TransactionContext;
use crate::core::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// History event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryEvent {
    ProcessStarted {
        process_instance_id: String,
        definition_key: String,
        business_key: Option<String>,
    },
    ProcessEnded {
        process_instance_id: String,
        reason: Option<String>,
    },
    ActivityStarted {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
    },
    ActivityEnded {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
    },
    TaskCreated {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
    },
    TaskCompleted {
        process_instance_id: String,
        execution_id: String,
        activity_id: String,
    },
    JobFailed {
        job_id: String,
        process_instance_id: Option<String>,
        retries_left: u32,
        message: String,
    },
}

impl HistoryEvent {
    pub fn process_instance_id(&self) -> Option<&str> {
        match self {
            HistoryEvent::ProcessStarted {
                process_instance_id,
                ..
            }
            | HistoryEvent::ProcessEnded {
                process_instance_id,
                ..
            }
            | HistoryEvent::ActivityStarted {
                process_instance_id,
                ..
            }
            | HistoryEvent::ActivityEnded {
                process_instance_id,
                ..
            }
            | HistoryEvent::TaskCreated {
                process_instance_id,
                ..
            }
            | HistoryEvent::TaskCompleted {
                process_instance_id,
                ..
            } => Some(process_instance_id.as_str()),
            HistoryEvent::JobFailed {
                process_instance_id,
                ..
            } => process_instance_id.as_deref(),
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Command that produced the event
    pub command: Option<String>,
    pub event: HistoryEvent,
}

/// Receives committed history
pub trait HistorySink: Send + Sync {
    fn record(&self, envelope: &HistoryEnvelope) -> anyhow::Result<()>;
}

/// A simple logging history sink
pub struct LoggingHistorySink;

impl HistorySink for LoggingHistorySink {
    fn record(&self, envelope: &HistoryEnvelope) -> anyhow::Result<()> {
        debug!("History: {}", serde_json::to_string(envelope)?);
        Ok(())
    }
}

/// A buffering history sink that collects events
#[derive(Default, Clone)]
pub struct BufferingHistorySink {
    events: Arc<RwLock<Vec<HistoryEnvelope>>>,
}

impl BufferingHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<HistoryEnvelope> {
        self.events.read().clone()
    }

    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    /// Events of one process instance, in recording order
    pub fn events_for(&self, process_instance_id: &str) -> Vec<HistoryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event.process_instance_id() == Some(process_instance_id))
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl HistorySink for BufferingHistorySink {
    fn record(&self, envelope: &HistoryEnvelope) -> anyhow::Result<()> {
        self.events.write().push(envelope.clone());
        Ok(())
    }
}

/// Global sequence counter for history events
static HISTORY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next history sequence number
pub fn next_sequence() -> u64 {
    HISTORY_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Per-command history buffer
pub struct HistorySession {
    sink: Arc<dyn HistorySink>,
    buffered: Vec<HistoryEnvelope>,
}

impl HistorySession {
    pub fn new(sink: Arc<dyn HistorySink>) -> Self {
        Self {
            sink,
            buffered: Vec::new(),
        }
    }

    pub fn record(&mut self, event: HistoryEvent) {
        let scope = context::current();
        self.buffered.push(HistoryEnvelope {
            sequence: next_sequence(),
            timestamp: context::now(),
            command: scope.map(|s| s.command().to_string()),
            event,
        });
    }

    pub fn pending(&self) -> usize {
        self.buffered.len()
    }
}

#[async_trait]
impl Session for HistorySession {
    async fn flush(&mut self, tx: &mut dyn TransactionContext) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let envelopes = std::mem::take(&mut self.buffered);
        let sink = self.sink.clone();
        tx.on_commit(Box::new(move || {
            for envelope in &envelopes {
                if let Err(e) = sink.record(envelope) {
                    warn!(sequence = envelope.sequence, error = %e, "History sink rejected event");
                }
            }
        }));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.buffered.is_empty() {
            debug!(dropped = self.buffered.len(), "Discarding unflushed history");
            self.buffered.clear();
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
