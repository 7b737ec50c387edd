use async_trait::async_trait;
use orchestra_core::domain::condition::{
    default_expression_language, ConditionEvaluator, ConditionExpression, DefaultConditionEvaluator,
};
use orchestra_core::{ComponentConfig, ComponentEmitter, ComponentRuntime, Context, CoreError};
use serde::Deserialize;
use std::time::Duration;

use super::parse_config;

/// Always fails with the configured message
#[derive(Debug)]
pub struct Fail {
    message: String,
}

#[derive(Deserialize)]
struct FailConfig {
    message: Option<String>,
}

impl Fail {
    /// Fail with the default message
    pub fn new() -> Self {
        Self {
            message: "failed on purpose".to_string(),
        }
    }
}

impl Default for Fail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComponentRuntime for Fail {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        let config: FailConfig = parse_config(crate::FAIL, config)?;
        if let Some(message) = config.message {
            self.message = message;
        }
        Ok(())
    }

    async fn run(&self, _context: Context, emitter: ComponentEmitter) {
        emitter.logger().warn(&self.message);
        let message = self.message.clone();
        emitter.failure(message);
    }
}

/// Sleeps for `durationMs` before passing the context through
#[derive(Debug, Default)]
pub struct Delay {
    duration: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayConfig {
    duration_ms: u64,
}

impl Delay {
    /// Delay with no configured duration
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComponentRuntime for Delay {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        let config: DelayConfig = parse_config(crate::DELAY, config)?;
        self.duration = Duration::from_millis(config.duration_ms);
        Ok(())
    }

    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        tokio::time::sleep(self.duration).await;
        emitter
            .logger()
            .debug(&format!("waited {}ms", self.duration.as_millis()));
        emitter.success(context);
    }
}

/// Holds activation back until its `when` expression is truthy against the
/// run variables. Once activated it passes the context through.
pub struct Gate {
    condition: Option<ConditionExpression>,
    evaluator: DefaultConditionEvaluator,
}

#[derive(Deserialize)]
struct GateConfig {
    when: String,
    #[serde(default = "default_expression_language")]
    language: String,
}

impl Gate {
    /// Unconfigured gate; it stays closed until configured
    pub fn new() -> Self {
        Self {
            condition: None,
            evaluator: DefaultConditionEvaluator,
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComponentRuntime for Gate {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        let config: GateConfig = parse_config(crate::GATE, config)?;
        self.condition = Some(ConditionExpression {
            expression: config.when,
            language: config.language,
        });
        Ok(())
    }

    async fn can_activate(&self, context: &Context, emitter: ComponentEmitter) {
        let Some(condition) = &self.condition else {
            emitter.failure(CoreError::ConfigurationError("gate has no `when` expression".into()));
            return;
        };
        match self.evaluator.evaluate(condition, &context.variables_value()) {
            Ok(true) => emitter.success(context.clone()),
            Ok(false) => {
                let reason = format!("`{}` is not satisfied yet", condition.expression);
                emitter.logger().info(&reason);
                emitter.failure(reason);
            }
            Err(e) => emitter.failure(e),
        }
    }

    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        emitter.success(context);
    }
}
