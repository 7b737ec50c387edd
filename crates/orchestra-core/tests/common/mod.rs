#![allow(dead_code)]

use async_trait::async_trait;
use orchestra_core::application::connectors::{ConnectorKey, ConnectorRegistry};
use orchestra_core::domain::component::WorkflowComponent;
use orchestra_core::{
    ComponentConfig, ComponentEmitter, ComponentFactory, ComponentRuntime, Context, CoreError, OrchestraConfig,
    RuntimeInterface, Stores, Variables, WorkflowExecution, WorkflowExecutionId, YamlWorkflowConverter,
};
use orchestra_core::application::converter::ProcessConverter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Merges its `output` object into the variables, after an optional `delayMs`
#[derive(Default)]
pub struct Set {
    output: Variables,
    delay: Option<Duration>,
}

#[async_trait]
impl ComponentRuntime for Set {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        if let Some(output) = config.get("output") {
            self.output = output
                .as_object()
                .cloned()
                .ok_or_else(|| CoreError::ConfigurationError("output must be an object".into()))?;
        }
        self.delay = config.get("delayMs").and_then(|v| v.as_u64()).map(Duration::from_millis);
        Ok(())
    }

    async fn run(&self, mut context: Context, emitter: ComponentEmitter) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        context.variables.extend(self.output.clone());
        emitter.logger().info("variables set");
        emitter.success(context);
    }
}

/// Always fails
pub struct Boom;

#[async_trait]
impl ComponentRuntime for Boom {
    async fn run(&self, _context: Context, emitter: ComponentEmitter) {
        emitter.failure("boom");
    }
}

/// Cannot activate while the shared flag is false
pub struct Gate {
    pub open: Arc<AtomicBool>,
}

#[async_trait]
impl ComponentRuntime for Gate {
    async fn can_activate(&self, context: &Context, emitter: ComponentEmitter) {
        if self.open.load(Ordering::SeqCst) {
            emitter.success(context.clone());
        } else {
            emitter.failure("gate closed");
        }
    }

    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        emitter.success(context);
    }
}

/// Parks on the connector registry until a payload is delivered
pub struct Hook {
    pub connectors: Arc<ConnectorRegistry>,
}

#[async_trait]
impl ComponentRuntime for Hook {
    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        let key = ConnectorKey::new(emitter.step().execution_id.as_str(), emitter.step().node_key.clone());
        let mut parked = context;
        let result = self.connectors.add_listener(
            key,
            Box::new(move |payload| {
                if let Some(fields) = payload.as_object() {
                    parked.variables.extend(fields.clone());
                }
                emitter.success(parked);
            }),
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not park hook");
        }
    }
}

/// Requires a `required` config key
#[derive(Default)]
pub struct Strict;

#[async_trait]
impl ComponentRuntime for Strict {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        if config.contains_key("required") {
            Ok(())
        } else {
            Err(CoreError::ConfigurationError("missing key: required".into()))
        }
    }

    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        emitter.success(context);
    }
}

pub fn factory<F>(make: F) -> Option<Arc<dyn ComponentFactory>>
where
    F: Fn() -> Box<dyn ComponentRuntime> + Send + Sync + 'static,
{
    Some(Arc::new(make))
}

pub struct Harness {
    pub runtime: Arc<RuntimeInterface>,
    pub gate: Arc<AtomicBool>,
}

pub async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let runtime = Arc::new(RuntimeInterface::new(OrchestraConfig::default(), Stores::in_memory(), None).unwrap());
    let gate = Arc::new(AtomicBool::new(false));

    runtime
        .register_component(WorkflowComponent::new("test.set"), factory(|| Box::new(Set::default()) as Box<dyn ComponentRuntime>))
        .await
        .unwrap();
    runtime
        .register_component(WorkflowComponent::new("test.boom"), factory(|| Box::new(Boom) as Box<dyn ComponentRuntime>))
        .await
        .unwrap();
    runtime
        .register_component(WorkflowComponent::new("test.strict"), factory(|| Box::new(Strict) as Box<dyn ComponentRuntime>))
        .await
        .unwrap();
    let open = gate.clone();
    runtime
        .register_component(
            WorkflowComponent::new("test.gate"),
            factory(move || Box::new(Gate { open: open.clone() }) as Box<dyn ComponentRuntime>),
        )
        .await
        .unwrap();
    let connectors = runtime.connectors().clone();
    runtime
        .register_component(
            WorkflowComponent::new("test.hook"),
            factory(move || {
                Box::new(Hook {
                    connectors: connectors.clone(),
                }) as Box<dyn ComponentRuntime>
            }),
        )
        .await
        .unwrap();

    runtime.start().unwrap();
    Harness { runtime, gate }
}

pub async fn deploy(runtime: &RuntimeInterface, yaml: &str) {
    let workflow = YamlWorkflowConverter.convert(yaml).unwrap();
    runtime.deploy(workflow).await.unwrap();
}

/// Poll a run until `check` holds
pub async fn wait_until<F>(runtime: &RuntimeInterface, id: &WorkflowExecutionId, check: F) -> WorkflowExecution
where
    F: Fn(&WorkflowExecution) -> bool,
{
    let poll = async {
        loop {
            let execution = runtime.execution(id).await.unwrap();
            if check(&execution) {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll).await.expect("condition not reached in time")
}

pub fn vars(value: serde_json::Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}
