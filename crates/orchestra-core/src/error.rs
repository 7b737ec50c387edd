use thiserror::Error;

/// Core error type for the Orchestra runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad or missing component configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A uniqueness constraint on a business key was violated
    #[error("Duplicate key in {collection}: {field}={value}")]
    DuplicateKey {
        /// Collection the write targeted
        collection: String,
        /// Name of the constrained field
        field: String,
        /// Conflicting value
        value: String,
    },

    /// A workflow, execution, component or event is absent
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing record
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// A component runtime reported failure
    #[error("Component execution failure: {0}")]
    ComponentExecutionFailure(String),

    /// Malformed event or unresolvable correlation/causation
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Optimistic write lost against a concurrent writer
    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Build a typed "not found" error
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Whether this error is a uniqueness violation
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, CoreError::DuplicateKey { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
