//! Interaction sink that writes entries to the tracing pipeline

use async_trait::async_trait;
use orchestra_core::application::interaction::{InteractionEntry, InteractionSink, InteractionType};
use orchestra_core::{CoreError, LogLevel};

/// Forwards interaction entries as tracing events under the
/// `orchestra::interaction` target, so they share the process log pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInteractionSink;

impl TracingInteractionSink {
    /// New sink
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InteractionSink for TracingInteractionSink {
    async fn log(&self, entry: InteractionEntry) -> Result<(), CoreError> {
        let kind = match entry.interaction_type {
            InteractionType::Log => "log",
            InteractionType::Message => "message",
        };
        macro_rules! emit {
            ($level:ident) => {
                tracing::$level!(
                    target: "orchestra::interaction",
                    execution_id = %entry.run_id,
                    domain = %entry.domain,
                    correlation_id = %entry.exec_id,
                    node_key = %entry.node_key,
                    component = %entry.component,
                    actor = ?entry.actor,
                    visibility = ?entry.visibility,
                    kind,
                    "{}",
                    entry.content
                )
            };
        }
        match entry.level {
            LogLevel::Debug => emit!(debug),
            LogLevel::Info => emit!(info),
            LogLevel::Warn => emit!(warn),
            LogLevel::Error => emit!(error),
        }
        Ok(())
    }
}
