//! Fire-and-forget interaction log
//!
//! Step-level log lines and messages are pushed onto a bounded queue and
//! drained by a detached task into an [`InteractionSink`]. Pushing never
//! blocks: a full queue drops the entry, and sink failures are logged and
//! swallowed by the drain task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::config::InteractionLogConfig;
use crate::domain::component::Actor;
use crate::types::{CorrelationId, LogLevel, WorkflowExecutionId};
use crate::CoreError;

/// Kind of interaction entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionType {
    /// Component log line
    Log,
    /// Message addressed to the run's participants
    Message,
}

/// Who may see an interaction entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// Operators only
    #[default]
    Internal,
    /// Everyone with access to the run
    Public,
}

/// One interaction entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEntry {
    /// Run the entry belongs to
    pub run_id: WorkflowExecutionId,
    /// Workflow domain
    pub domain: String,
    /// Node activation the entry belongs to
    pub exec_id: CorrelationId,
    /// Node id
    pub node_id: String,
    /// Node key
    pub node_key: String,
    /// Component domain
    pub component: String,
    /// Producer
    pub actor: Actor,
    /// Entry type
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    /// Level, for log entries
    pub level: LogLevel,
    /// Audience
    pub visibility: Visibility,
    /// Text
    pub content: String,
    /// Creation time
    pub created_date: DateTime<Utc>,
}

/// Destination of interaction entries
#[async_trait]
pub trait InteractionSink: Send + Sync {
    /// Persist or forward one entry
    async fn log(&self, entry: InteractionEntry) -> Result<(), CoreError>;
}

/// Handle for pushing interaction entries
#[derive(Clone, Default)]
pub struct InteractionLog {
    sender: Option<mpsc::Sender<InteractionEntry>>,
}

impl InteractionLog {
    /// Start the drain task. Must be called inside a tokio runtime.
    pub fn spawn(config: &InteractionLogConfig, sink: Arc<dyn InteractionSink>) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let (sender, mut receiver) = mpsc::channel::<InteractionEntry>(config.capacity.max(1));
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                let run_id = entry.run_id.clone();
                if let Err(e) = sink.log(entry).await {
                    warn!(execution_id = %run_id, error = %e, "Interaction sink rejected entry");
                }
            }
            debug!("Interaction log drained");
        });

        Self {
            sender: Some(sender),
        }
    }

    /// A log that discards everything
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Whether entries are forwarded
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Push an entry without waiting
    pub fn log(&self, entry: InteractionEntry) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                warn!(
                    execution_id = %entry.run_id,
                    node_key = %entry.node_key,
                    "Interaction log queue full, dropping entry"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Interaction log closed, dropping entry");
            }
        }
    }
}

/// Memory implementations
#[cfg(feature = "memory")]
pub mod memory {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// Sink collecting entries in memory
    #[derive(Default)]
    pub struct MemoryInteractionSink {
        entries: Mutex<Vec<InteractionEntry>>,
    }

    impl MemoryInteractionSink {
        /// Create an empty sink
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of the collected entries
        pub fn entries(&self) -> Vec<InteractionEntry> {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl InteractionSink for MemoryInteractionSink {
        async fn log(&self, entry: InteractionEntry) -> Result<(), CoreError> {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry);
            Ok(())
        }
    }
}
