use async_trait::async_trait;
use orchestra_core::{ComponentConfig, ComponentEmitter, ComponentRuntime, Context, CoreError, Variables};
use serde::Deserialize;

use super::parse_config;

/// Merges a fixed `output` object into the run variables
#[derive(Debug, Default)]
pub struct Echo {
    output: Variables,
}

#[derive(Deserialize)]
struct EchoConfig {
    #[serde(default)]
    output: Variables,
}

impl Echo {
    /// Echo with nothing to merge
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComponentRuntime for Echo {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        let config: EchoConfig = parse_config(crate::ECHO, config)?;
        self.output = config.output;
        Ok(())
    }

    async fn run(&self, mut context: Context, emitter: ComponentEmitter) {
        emitter
            .logger()
            .debug(&format!("merging {} variable(s)", self.output.len()));
        context.variables.extend(self.output.clone());
        emitter.success(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::emitter;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_merges_output() {
        let mut echo = Echo::new();
        let config = json!({"output": {"status": "ok", "count": 2}});
        echo.configure(config.as_object().unwrap()).unwrap();

        let mut context = Context::default();
        context.variables.insert("status".to_string(), json!("pending"));
        context.variables.insert("id".to_string(), json!(7));

        let (emitter, outcome) = emitter(crate::ECHO);
        echo.run(context, emitter).await;

        let output = outcome.await.unwrap().unwrap();
        assert_eq!(output.variables["status"], json!("ok"));
        assert_eq!(output.variables["count"], json!(2));
        assert_eq!(output.variables["id"], json!(7));
    }

    #[test]
    fn test_echo_rejects_non_object_output() {
        let mut echo = Echo::new();
        let config = json!({"output": [1, 2]});
        let err = echo.configure(config.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }
}
