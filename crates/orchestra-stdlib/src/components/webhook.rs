use async_trait::async_trait;
use orchestra_core::{
    ComponentConfig, ComponentEmitter, ComponentRuntime, ConnectorKey, ConnectorRegistry, Context, CoreError,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::parse_config;

/// Parks the node on the connector registry until a payload is delivered
/// for `(run, node key)`.
///
/// An object payload is merged into the variables; with `field` set, the
/// whole payload is stored under that name instead.
pub struct Webhook {
    connectors: Arc<ConnectorRegistry>,
    field: Option<String>,
}

#[derive(Deserialize)]
struct WebhookConfig {
    field: Option<String>,
}

impl Webhook {
    /// Webhook parking on `connectors`
    pub fn new(connectors: Arc<ConnectorRegistry>) -> Self {
        Self {
            connectors,
            field: None,
        }
    }
}

fn deliver(mut context: Context, field: Option<&str>, payload: Value) -> Context {
    match (field, payload) {
        (Some(field), payload) => {
            context.variables.insert(field.to_string(), payload);
        }
        (None, Value::Object(fields)) => context.variables.extend(fields),
        (None, Value::Null) => {}
        (None, other) => {
            context.variables.insert("payload".to_string(), other);
        }
    }
    context
}

#[async_trait]
impl ComponentRuntime for Webhook {
    fn configure(&mut self, config: &ComponentConfig) -> Result<(), CoreError> {
        let config: WebhookConfig = parse_config(crate::WEBHOOK, config)?;
        self.field = config.field;
        Ok(())
    }

    async fn run(&self, context: Context, emitter: ComponentEmitter) {
        let key = ConnectorKey::new(emitter.step().execution_id.as_str(), emitter.step().node_key.as_str());
        let field = self.field.clone();
        let logger = emitter.logger().clone();

        let parked = self.connectors.add_listener(
            key.clone(),
            Box::new(move |payload| {
                emitter.logger().info("payload received");
                emitter.success(deliver(context, field.as_deref(), payload));
            }),
        );
        match parked {
            Ok(()) => logger.info(&format!("waiting for a signal on {}", key)),
            // The callback owned the emitter; dropping it reports the failure.
            Err(e) => logger.error(&format!("could not park webhook: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::emitter;
    use serde_json::json;

    #[tokio::test]
    async fn test_webhook_completes_on_signal() {
        let connectors = Arc::new(ConnectorRegistry::new());
        let webhook = Webhook::new(connectors.clone());

        let mut context = Context::default();
        context.variables.insert("order".to_string(), json!(1));
        let (emitter, outcome) = emitter(crate::WEBHOOK);
        webhook.run(context, emitter).await;

        let key = ConnectorKey::new("run-1", "task_step");
        assert!(connectors.contains(&key));
        connectors.invoke(&key, json!({"approved": true})).unwrap();

        let output = outcome.await.unwrap().unwrap();
        assert_eq!(output.variables["approved"], json!(true));
        assert_eq!(output.variables["order"], json!(1));
        assert!(connectors.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_stores_payload_under_field() {
        let connectors = Arc::new(ConnectorRegistry::new());
        let mut webhook = Webhook::new(connectors.clone());
        webhook
            .configure(json!({"field": "reply"}).as_object().unwrap())
            .unwrap();

        let (emitter, outcome) = emitter(crate::WEBHOOK);
        webhook.run(Context::default(), emitter).await;
        connectors
            .invoke(&ConnectorKey::new("run-1", "task_step"), json!([1, 2]))
            .unwrap();

        let output = outcome.await.unwrap().unwrap();
        assert_eq!(output.variables["reply"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_second_park_on_same_key_fails() {
        let connectors = Arc::new(ConnectorRegistry::new());
        let webhook = Webhook::new(connectors.clone());

        let (first, _pending) = emitter(crate::WEBHOOK);
        webhook.run(Context::default(), first).await;
        let (second, outcome) = emitter(crate::WEBHOOK);
        webhook.run(Context::default(), second).await;

        assert!(outcome.await.is_err());
        assert_eq!(connectors.len(), 1);
    }

    #[test]
    fn test_scalar_payload_lands_under_payload() {
        let context = deliver(Context::default(), None, json!("hi"));
        assert_eq!(context.variables["payload"], json!("hi"));
        assert!(deliver(Context::default(), None, Value::Null).variables.is_empty());
    }
}
