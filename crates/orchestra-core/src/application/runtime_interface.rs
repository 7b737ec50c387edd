//! Runtime facade
//!
//! Wires the stores, registries, bus, orchestrator, runtime engine and
//! dispatcher together and exposes the operations callers need: deploy a
//! workflow, trigger and observe runs, deliver connector signals and
//! register components.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::application::connectors::{ConnectorKey, ConnectorRegistry};
use crate::application::converter::ProcessConverter;
use crate::application::dispatch::{EventDispatcher, EventPublisher, InMemoryEventBus};
use crate::application::handlers::HandlerRegistry;
use crate::application::interaction::{InteractionLog, InteractionSink};
use crate::application::orchestrator::Orchestrator;
use crate::application::registry::{
    EventRegistry, ProcessRegistry, WorkflowComponentRegistry, WorkflowExecutionRegistry, WorkflowRegistry,
};
use crate::application::runtime_engine::RuntimeEngine;
use crate::config::OrchestraConfig;
use crate::domain::component::WorkflowComponent;
use crate::domain::condition::DefaultConditionEvaluator;
use crate::domain::events::Event;
use crate::domain::execution::WorkflowExecution;
use crate::domain::process::Process;
use crate::domain::repository::DocumentRepository;
use crate::domain::workflow::Workflow;
use crate::runtime::{ComponentFactory, RuntimeRegistry};
use crate::types::{Variables, WorkflowExecutionId, WorkflowId};
use crate::CoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Document stores backing the runtime
#[derive(Clone)]
pub struct Stores {
    /// Workflow definitions
    pub workflows: Arc<dyn DocumentRepository<Workflow>>,
    /// Runs
    pub executions: Arc<dyn DocumentRepository<WorkflowExecution>>,
    /// Component catalogue
    pub components: Arc<dyn DocumentRepository<WorkflowComponent>>,
    /// Source process definitions
    pub processes: Arc<dyn DocumentRepository<Process>>,
    /// Event log
    pub events: Arc<dyn DocumentRepository<Event>>,
}

#[cfg(feature = "memory")]
impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        use crate::domain::repository::memory::MemoryDocumentRepository;
        Self {
            workflows: Arc::new(MemoryDocumentRepository::new()),
            executions: Arc::new(MemoryDocumentRepository::new()),
            components: Arc::new(MemoryDocumentRepository::new()),
            processes: Arc::new(MemoryDocumentRepository::new()),
            events: Arc::new(MemoryDocumentRepository::new()),
        }
    }
}

/// Facade over one orchestration runtime
pub struct RuntimeInterface {
    workflows: Arc<WorkflowRegistry>,
    executions: Arc<WorkflowExecutionRegistry>,
    components: Arc<WorkflowComponentRegistry>,
    processes: Arc<ProcessRegistry>,
    events: Arc<EventRegistry>,
    runtimes: Arc<RuntimeRegistry>,
    connectors: Arc<ConnectorRegistry>,
    bus: Arc<InMemoryEventBus>,
    publisher: EventPublisher,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<EventDispatcher>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl RuntimeInterface {
    /// Build a runtime. Must be called inside a tokio runtime when an
    /// interaction sink is given, since the log drain task starts here.
    pub fn new(
        config: OrchestraConfig,
        stores: Stores,
        sink: Option<Arc<dyn InteractionSink>>,
    ) -> Result<Self, CoreError> {
        let workflows = Arc::new(WorkflowRegistry::new(stores.workflows));
        let executions = Arc::new(WorkflowExecutionRegistry::new(
            stores.executions,
            config.dispatch.max_update_attempts,
        ));
        let components = Arc::new(WorkflowComponentRegistry::new(stores.components));
        let processes = Arc::new(ProcessRegistry::new(stores.processes));
        let events = Arc::new(EventRegistry::new(
            stores.events,
            config.dispatch.max_update_attempts,
        ));
        let runtimes = Arc::new(RuntimeRegistry::new());
        let connectors = Arc::new(ConnectorRegistry::new());

        let (bus, receiver) = InMemoryEventBus::new(config.dispatch.queue_capacity);
        let bus = Arc::new(bus);
        let publisher = EventPublisher::new(events.clone(), bus.clone());

        let interactions = match sink {
            Some(sink) => InteractionLog::spawn(&config.interaction_log, sink),
            None => InteractionLog::disabled(),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            workflows.clone(),
            executions.clone(),
            publisher.clone(),
            Arc::new(DefaultConditionEvaluator),
        ));
        let engine = Arc::new(RuntimeEngine::new(
            runtimes.clone(),
            components.clone(),
            connectors.clone(),
            publisher.clone(),
            interactions,
            config.dispatch.activation_timeout(),
        ));
        let handlers = HandlerRegistry::standard(orchestrator.clone(), engine)?;
        let dispatcher = Arc::new(EventDispatcher::new(
            handlers,
            events.clone(),
            workflows.clone(),
            executions.clone(),
            publisher.clone(),
        ));

        Ok(Self {
            workflows,
            executions,
            components,
            processes,
            events,
            runtimes,
            connectors,
            bus,
            publisher,
            orchestrator,
            dispatcher,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Start the dispatch loop. Fails if it was already started.
    pub fn start(&self) -> Result<JoinHandle<()>, CoreError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CoreError::ConfigurationError("dispatcher already started".to_string()))?;
        Ok(Arc::clone(&self.dispatcher).spawn(receiver))
    }

    /// Validate and register a workflow
    pub async fn deploy(&self, workflow: Workflow) -> Result<WorkflowId, CoreError> {
        workflow.validate()?;
        self.workflows.register(workflow).await
    }

    /// Convert a process definition, register the workflow and keep the source
    pub async fn deploy_process(
        &self,
        definition: &str,
        converter: &dyn ProcessConverter,
    ) -> Result<WorkflowId, CoreError> {
        let workflow = converter.convert(definition)?;
        let mut process = Process::new(workflow.domain.clone(), definition);
        process.name = workflow.name.clone();

        let workflow_id = self.deploy(workflow).await?;
        process.workflow_id = Some(workflow_id.clone());
        let process = self.processes.register(process).await?;
        info!(domain = %process.domain, %workflow_id, "Process deployed");
        Ok(workflow_id)
    }

    /// Start a run of the workflow registered under `domain`
    pub async fn trigger(&self, domain: &str, variables: Variables) -> Result<WorkflowExecutionId, CoreError> {
        self.orchestrator.start(domain, variables).await
    }

    /// Current state of a run
    pub async fn execution(&self, id: &WorkflowExecutionId) -> Result<WorkflowExecution, CoreError> {
        self.executions.get(id).await
    }

    /// Poll a run until it reaches a terminal status
    pub async fn wait_for_terminal(
        &self,
        id: &WorkflowExecutionId,
        timeout: Duration,
    ) -> Result<WorkflowExecution, CoreError> {
        let poll = async {
            loop {
                let execution = self.executions.get(id).await?;
                if execution.status.is_terminal() {
                    return Ok::<_, CoreError>(execution);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| CoreError::Timeout(format!("run {} not finished after {:?}", id, timeout)))?
    }

    /// Stop a run
    pub async fn terminate(&self, id: &WorkflowExecutionId, reason: Option<String>) -> Result<bool, CoreError> {
        self.orchestrator.terminate(id, reason).await
    }

    /// Deliver an external payload to the connector parked for a run's node
    pub fn signal(&self, id: &WorkflowExecutionId, node_key: &str, payload: Value) -> Result<(), CoreError> {
        debug!(execution_id = %id, %node_key, "Delivering signal");
        self.connectors.invoke(&ConnectorKey::new(id.as_str(), node_key), payload)
    }

    /// Add a component to the catalogue, with a local factory unless it is remote
    pub async fn register_component(
        &self,
        component: WorkflowComponent,
        factory: Option<Arc<dyn ComponentFactory>>,
    ) -> Result<WorkflowComponent, CoreError> {
        if let Some(factory) = factory {
            self.runtimes.register(component.domain.clone(), factory);
        }
        self.components.register(component).await
    }

    /// Publish an event produced outside the runtime, such as a remote
    /// provider's outcome or a component trigger
    pub async fn publish(&self, event: Event) -> Result<(), CoreError> {
        self.publisher.publish(event).await
    }

    /// Subscribe to every event published from now on
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.bus.tap()
    }

    /// Workflow registry
    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.workflows
    }

    /// Run registry
    pub fn executions(&self) -> &Arc<WorkflowExecutionRegistry> {
        &self.executions
    }

    /// Component catalogue
    pub fn components(&self) -> &Arc<WorkflowComponentRegistry> {
        &self.components
    }

    /// Process registry
    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    /// Event log
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// Local runtime factories
    pub fn runtimes(&self) -> &Arc<RuntimeRegistry> {
        &self.runtimes
    }

    /// Connector callbacks
    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Event dispatcher
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }
}
