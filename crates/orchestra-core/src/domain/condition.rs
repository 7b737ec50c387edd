use crate::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guard expression attached to a branch option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionExpression {
    /// The condition expression
    pub expression: String,

    /// The language of the expression
    #[serde(default = "default_expression_language")]
    pub language: String,
}

/// Default expression language
pub fn default_expression_language() -> String {
    "jmespath".to_string()
}

impl ConditionExpression {
    /// Create a JMESPath condition
    pub fn jmespath(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            language: default_expression_language(),
        }
    }
}

/// Evaluates a branch guard against the run variables
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate the condition within the given data
    fn evaluate(&self, condition: &ConditionExpression, data: &Value) -> Result<bool, CoreError>;
}

/// Default condition evaluator using JMESPath truthiness
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(&self, condition: &ConditionExpression, data: &Value) -> Result<bool, CoreError> {
        match condition.language.as_str() {
            "jmespath" => {
                let compiled = jmespath::compile(&condition.expression).map_err(|e| {
                    CoreError::ExpressionError(format!(
                        "Failed to compile JMESPath expression: {}: {}",
                        condition.expression, e
                    ))
                })?;
                let result = compiled.search(data).map_err(|e| {
                    CoreError::ExpressionError(format!(
                        "Failed to evaluate JMESPath expression: {}: {}",
                        condition.expression, e
                    ))
                })?;
                Ok(result.is_truthy())
            }
            other => Err(CoreError::ExpressionError(format!(
                "Unsupported condition language: {}",
                other
            ))),
        }
    }
}
