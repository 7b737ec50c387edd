//! Component runtime abstraction
//!
//! A [`ComponentRuntime`] executes the logic of one node. It reports back
//! through a [`ComponentEmitter`], which is consumed by `success` or `failure`
//! so an outcome is delivered at most once. An emitter dropped without an
//! outcome is observed by the engine as a failure.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::application::interaction::{InteractionEntry, InteractionLog, InteractionType, Visibility};
use crate::domain::component::Actor;
use crate::domain::context::Context;
use crate::domain::workflow::ComponentConfig;
use crate::types::{CorrelationId, LogLevel, WorkflowExecutionId};
use crate::CoreError;

/// Outcome delivered through an emitter
pub type StepResult = Result<Context, String>;

/// Identity of the step a runtime is executing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Run
    pub execution_id: WorkflowExecutionId,
    /// Workflow domain
    pub workflow_domain: String,
    /// Activation the step belongs to
    pub correlation_id: CorrelationId,
    /// Node id
    pub node_id: String,
    /// Node key
    pub node_key: String,
    /// Component domain
    pub component: String,
}

/// Structured step logger
///
/// Lines go to `tracing` with the step's identifiers as fields and are
/// forwarded to the interaction log.
#[derive(Clone)]
pub struct StepLogger {
    step: Arc<StepInfo>,
    interactions: InteractionLog,
}

impl StepLogger {
    /// Logger for a step
    pub fn new(step: StepInfo, interactions: InteractionLog) -> Self {
        Self {
            step: Arc::new(step),
            interactions,
        }
    }

    /// Step identity
    pub fn step(&self) -> &StepInfo {
        &self.step
    }

    /// Log a line at `level`
    pub fn log(&self, level: LogLevel, message: &str) {
        let step = &self.step;
        match level {
            LogLevel::Debug => debug!(execution_id = %step.execution_id, node_key = %step.node_key, component = %step.component, "{}", message),
            LogLevel::Info => info!(execution_id = %step.execution_id, node_key = %step.node_key, component = %step.component, "{}", message),
            LogLevel::Warn => warn!(execution_id = %step.execution_id, node_key = %step.node_key, component = %step.component, "{}", message),
            LogLevel::Error => error!(execution_id = %step.execution_id, node_key = %step.node_key, component = %step.component, "{}", message),
        }

        self.interactions.log(InteractionEntry {
            run_id: step.execution_id.clone(),
            domain: step.workflow_domain.clone(),
            exec_id: step.correlation_id.clone(),
            node_id: step.node_id.clone(),
            node_key: step.node_key.clone(),
            component: step.component.clone(),
            actor: Actor::System,
            interaction_type: InteractionType::Log,
            level,
            visibility: Visibility::Internal,
            content: message.to_string(),
            created_date: Utc::now(),
        });
    }

    /// DEBUG line
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// INFO line
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// WARN line
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// ERROR line
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// One-shot reporting channel handed to a runtime
pub struct ComponentEmitter {
    sender: oneshot::Sender<StepResult>,
    logger: StepLogger,
}

impl ComponentEmitter {
    /// Emitter plus the receiver the engine awaits
    pub fn channel(logger: StepLogger) -> (Self, oneshot::Receiver<StepResult>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender, logger }, receiver)
    }

    /// Report success with the updated context
    pub fn success(self, context: Context) {
        self.deliver(Ok(context));
    }

    /// Report failure
    pub fn failure(self, error: impl fmt::Display) {
        self.deliver(Err(error.to_string()));
    }

    /// Step logger
    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    /// Step identity
    pub fn step(&self) -> &StepInfo {
        self.logger.step()
    }

    fn deliver(self, result: StepResult) {
        if self.sender.send(result).is_err() {
            debug!(
                node_key = %self.logger.step().node_key,
                "Step outcome arrived after the engine stopped waiting"
            );
        }
    }
}

impl fmt::Debug for ComponentEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEmitter")
            .field("step", self.logger.step())
            .finish()
    }
}

/// Executable logic of a node
#[async_trait]
pub trait ComponentRuntime: Send + Sync {
    /// One-time setup from the node's component configuration.
    /// Fails with `ConfigurationError` on missing or mistyped keys.
    fn configure(&mut self, _config: &ComponentConfig) -> Result<(), CoreError> {
        Ok(())
    }

    /// Side-effect-free feasibility check. Reports success with the context
    /// unchanged, or failure with the reason activation is not possible yet.
    async fn can_activate(&self, context: &Context, emitter: ComponentEmitter) {
        emitter.success(context.clone());
    }

    /// Execute the unit of work and report exactly one outcome
    async fn run(&self, context: Context, emitter: ComponentEmitter);
}

/// Creates fresh runtime instances for a component domain
pub trait ComponentFactory: Send + Sync {
    /// New, unconfigured runtime
    fn create(&self) -> Box<dyn ComponentRuntime>;
}

impl<F> ComponentFactory for F
where
    F: Fn() -> Box<dyn ComponentRuntime> + Send + Sync,
{
    fn create(&self) -> Box<dyn ComponentRuntime> {
        self()
    }
}

/// Local runtime factories keyed by component domain
#[derive(Default)]
pub struct RuntimeRegistry {
    factories: DashMap<String, Arc<dyn ComponentFactory>>,
}

impl RuntimeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, returning whether one was replaced
    pub fn register(&self, domain: impl Into<String>, factory: Arc<dyn ComponentFactory>) -> bool {
        let domain = domain.into();
        let replaced = self.factories.insert(domain.clone(), factory).is_some();
        if replaced {
            warn!(component = %domain, "Replaced local component factory");
        } else {
            debug!(component = %domain, "Registered local component factory");
        }
        replaced
    }

    /// Whether a factory exists for `domain`
    pub fn contains(&self, domain: &str) -> bool {
        self.factories.contains_key(domain)
    }

    /// New runtime for `domain`
    pub fn create(&self, domain: &str) -> Option<Box<dyn ComponentRuntime>> {
        let factory = self.factories.get(domain).map(|f| Arc::clone(f.value()))?;
        Some(factory.create())
    }

    /// Registered domains, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }
}
