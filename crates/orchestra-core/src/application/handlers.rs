//! Event handlers
//!
//! Each (event class, origin) pair has exactly one handler. The default
//! `should_handle` is the only routing and idempotency guard: a processed,
//! misclassified or misrouted event is never handled.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::application::orchestrator::Orchestrator;
use crate::application::runtime_engine::RuntimeEngine;
use crate::domain::events::{Event, EventClass, EventOrigin};
use crate::CoreError;

/// Handler for one event class from one origin
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Expected discriminator
    fn event_class(&self) -> EventClass;

    /// Expected sender
    fn origin(&self) -> EventOrigin;

    /// Whether this handler should consume `event`
    fn should_handle(&self, event: &Event) -> bool {
        !event.is_processed() && event.class() == self.event_class() && event.origin == self.origin()
    }

    /// Perform the side effect. The returned events are persisted and published;
    /// an empty vector means nothing follows from this step.
    async fn handle(&self, event: &Event) -> Result<Vec<Event>, CoreError>;
}

/// Handlers keyed by (event class, origin)
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(EventClass, EventOrigin), Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The orchestrator and runtime engine handlers
    pub fn standard(orchestrator: Arc<Orchestrator>, engine: Arc<RuntimeEngine>) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        registry.register(Arc::new(ActivationRequestHandler(engine.clone())))?;
        registry.register(Arc::new(InvocationRequestHandler(engine.clone())))?;
        registry.register(Arc::new(TerminationRequestHandler(engine.clone())))?;
        registry.register(Arc::new(ComponentFinishedHandler(engine)))?;
        registry.register(Arc::new(ActivationResponseHandler(orchestrator.clone())))?;
        registry.register(Arc::new(InvocationResponseHandler(orchestrator.clone())))?;
        registry.register(Arc::new(TerminationResponseHandler(orchestrator.clone())))?;
        registry.register(Arc::new(ComponentTriggerHandler(orchestrator)))?;
        Ok(registry)
    }

    /// Add a handler; a second handler for the same route is a configuration error
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> Result<(), CoreError> {
        let route = (handler.event_class(), handler.origin());
        if self.handlers.contains_key(&route) {
            return Err(CoreError::ConfigurationError(format!(
                "handler for {} from {:?} already registered",
                route.0, route.1
            )));
        }
        self.handlers.insert(route, handler);
        Ok(())
    }

    /// Handler for a route
    pub fn get(&self, class: EventClass, origin: EventOrigin) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&(class, origin)).cloned()
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no route is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

macro_rules! route {
    ($(#[$meta:meta])* $name:ident($target:ty): $class:ident from $origin:ident => $method:ident) => {
        $(#[$meta])*
        pub struct $name(pub Arc<$target>);

        #[async_trait]
        impl EventHandler for $name {
            fn event_class(&self) -> EventClass {
                EventClass::$class
            }

            fn origin(&self) -> EventOrigin {
                EventOrigin::$origin
            }

            async fn handle(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
                self.0.$method(event).await
            }
        }
    };
}

route!(
    /// Runtime engine: can the node activate?
    ActivationRequestHandler(RuntimeEngine): ActivationRequest from Orchestrator => on_activation_request
);
route!(
    /// Runtime engine: run the node
    InvocationRequestHandler(RuntimeEngine): InvocationRequest from Orchestrator => on_invocation_request
);
route!(
    /// Runtime engine: stop a run
    TerminationRequestHandler(RuntimeEngine): TerminationRequest from Orchestrator => on_termination_request
);
route!(
    /// Runtime engine: outcome of a remote component
    ComponentFinishedHandler(RuntimeEngine): ComponentFinished from Component => on_component_finished
);
route!(
    /// Orchestrator: activation answer
    ActivationResponseHandler(Orchestrator): ActivationResponse from RuntimeEngine => on_activated
);
route!(
    /// Orchestrator: run outcome
    InvocationResponseHandler(Orchestrator): InvocationResponse from RuntimeEngine => on_invoked
);
route!(
    /// Orchestrator: termination acknowledgement
    TerminationResponseHandler(Orchestrator): TerminationResponse from RuntimeEngine => on_terminated
);
route!(
    /// Orchestrator: re-trigger a parked node
    ComponentTriggerHandler(Orchestrator): ComponentTrigger from Component => on_triggered
);
