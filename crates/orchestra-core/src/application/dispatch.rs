//! Event transport and dispatch
//!
//! Events are recorded before they are published. The dispatcher consumes the
//! bus, re-reads each event from the log, claims it, resolves its workflow and
//! run, hands it to the single matching handler and publishes what comes back.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::handlers::HandlerRegistry;
use crate::application::registry::{EventRegistry, WorkflowExecutionRegistry, WorkflowRegistry};
use crate::domain::events::{Event, EventContext};
use crate::CoreError;

/// Outbound event transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver one event to the dispatcher
    async fn publish(&self, event: Event) -> Result<(), CoreError>;
}

/// In-process bus backed by a bounded queue.
///
/// Every published event is also broadcast to taps, which is how out-of-process
/// component providers and tests observe the stream.
pub struct InMemoryEventBus {
    sender: mpsc::Sender<Event>,
    tap: broadcast::Sender<Event>,
}

impl InMemoryEventBus {
    /// Bus with a queue of `capacity` events, returning the dispatcher's receiver
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (tap, _) = broadcast::channel(capacity.max(1));
        (Self { sender, tap }, receiver)
    }

    /// Subscribe to every event published from now on
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), CoreError> {
        // No subscribers is fine.
        let _ = self.tap.send(event.clone());
        self.sender
            .send(event)
            .await
            .map_err(|e| CoreError::Other(format!("event bus closed, dropped {}", e.0.event_id)))
    }
}

/// Records events in the log, then puts them on the bus
#[derive(Clone)]
pub struct EventPublisher {
    events: Arc<EventRegistry>,
    bus: Arc<dyn EventBus>,
}

impl EventPublisher {
    /// Publisher over an event log and a bus
    pub fn new(events: Arc<EventRegistry>, bus: Arc<dyn EventBus>) -> Self {
        Self { events, bus }
    }

    /// Persist and publish
    pub async fn publish(&self, event: Event) -> Result<(), CoreError> {
        self.events.record(&event).await?;
        debug!(
            event_id = %event.event_id,
            class = %event.class(),
            correlation_id = %event.correlation_id,
            "Event published"
        );
        self.bus.publish(event).await
    }
}

/// Routes events from the bus to their handler
pub struct EventDispatcher {
    handlers: HandlerRegistry,
    events: Arc<EventRegistry>,
    workflows: Arc<WorkflowRegistry>,
    executions: Arc<WorkflowExecutionRegistry>,
    publisher: EventPublisher,
}

impl EventDispatcher {
    /// Dispatcher over a handler table and the stores handlers read from
    pub fn new(
        handlers: HandlerRegistry,
        events: Arc<EventRegistry>,
        workflows: Arc<WorkflowRegistry>,
        executions: Arc<WorkflowExecutionRegistry>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            handlers,
            events,
            workflows,
            executions,
            publisher,
        }
    }

    /// Consume `receiver` until the bus closes, one task per event
    pub fn spawn(self: Arc<Self>, mut receiver: mpsc::Receiver<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Event dispatcher started");
            while let Some(event) = receiver.recv().await {
                let dispatcher = Arc::clone(&self);
                let span = info_span!(
                    "dispatch",
                    event_id = %event.event_id,
                    class = %event.class(),
                    execution_id = %event.payload.execution_id()
                );
                tokio::spawn(
                    async move {
                        if let Err(e) = dispatcher.dispatch(event).await {
                            error!(error = %e, "Event dispatch failed");
                        }
                    }
                    .instrument(span),
                );
            }
            info!("Event bus closed, dispatcher stopped");
        })
    }

    /// Handle one event and publish its outputs, which are also returned.
    ///
    /// Events that are unknown to the log, unrouted or already claimed are
    /// dropped with a log line. A claimed event whose run cannot be resolved,
    /// whose handler fails or whose outputs cannot all be published fails the
    /// run it names. Every output is attempted before the first publish error
    /// is returned.
    pub async fn dispatch(&self, event: Event) -> Result<Vec<Event>, CoreError> {
        let Some(mut stored) = self.events.get(&event.event_id).await? else {
            warn!(event_id = %event.event_id, "Event not in the log, dropping");
            return Ok(Vec::new());
        };

        let Some(handler) = self.handlers.get(stored.class(), stored.origin) else {
            debug!(class = %stored.class(), origin = ?stored.origin, "No handler for event");
            return Ok(Vec::new());
        };
        if !handler.should_handle(&stored) {
            debug!(event_id = %stored.event_id, "Event already processed, skipping");
            return Ok(Vec::new());
        }
        if !self.events.mark_processed(&stored.event_id).await? {
            debug!(event_id = %stored.event_id, "Event claimed by another dispatch, skipping");
            return Ok(Vec::new());
        }

        if let Err(e) = self.ensure_orchestration_event_context(&mut stored).await {
            warn!(event_id = %stored.event_id, error = %e, "Event context unresolvable, failing run");
            self.escalate(&stored, stored.payload.node_key(), &e).await;
            return Ok(Vec::new());
        }

        let outputs = match handler.handle(&stored).await {
            Ok(outputs) => outputs,
            Err(CoreError::ProtocolViolation(detail)) => {
                warn!(event_id = %stored.event_id, %detail, "Protocol violation, dropping event");
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(event_id = %stored.event_id, error = %e, "Event handler failed");
                self.escalate(&stored, stored.payload.node_key(), &e).await;
                return Ok(Vec::new());
            }
        };

        // Run state already references every output, so each one is attempted.
        let mut failure: Option<(Option<String>, CoreError)> = None;
        for output in &outputs {
            if let Err(e) = self.publisher.publish(output.clone()).await {
                error!(event_id = %output.event_id, class = %output.class(), error = %e, "Could not publish handler output");
                if failure.is_none() {
                    failure = Some((output.payload.node_key().map(str::to_string), e));
                }
            }
        }
        match failure {
            None => Ok(outputs),
            Some((node_key, e)) => {
                let node_key = node_key.as_deref().or(stored.payload.node_key());
                self.escalate(&stored, node_key, &e).await;
                Err(e)
            }
        }
    }

    /// Attach the workflow and run an event refers to, loading them if needed
    pub async fn ensure_orchestration_event_context(&self, event: &mut Event) -> Result<(), CoreError> {
        if event.context().is_ok() {
            return Ok(());
        }

        let execution = self
            .executions
            .get(event.payload.execution_id())
            .await
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        if &execution.workflow_id != event.payload.workflow_id() {
            return Err(CoreError::ProtocolViolation(format!(
                "run {} belongs to workflow {}, event names {}",
                execution.workflow_execution_id,
                execution.workflow_id,
                event.payload.workflow_id()
            )));
        }
        let workflow = self
            .workflows
            .get_workflow(&execution.workflow_id)
            .await
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;

        event.attach_context(Arc::new(EventContext { workflow, execution }));
        Ok(())
    }

    /// Fail the run `event` belongs to, blaming `node_key`
    async fn escalate(&self, event: &Event, node_key: Option<&str>, cause: &CoreError) {
        let Some(node_key) = node_key else {
            return;
        };
        let message = cause.to_string();
        let result = self
            .executions
            .update(event.payload.execution_id(), |execution| {
                if execution.status.accepts_events() {
                    execution.fail(node_key, message.clone());
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(
                execution_id = %event.payload.execution_id(),
                error = %e,
                "Could not record handler failure on run"
            );
        }
    }
}
