use thiserror::Error;

/// Error types for the call distribution pipeline
///
/// The variants follow the subsystem that produced the failure so callers can
/// decide whether a failure is fatal to their loop (broker and pool failures at
/// startup) or merely worth a log line (persistence, delivery, malformed input).
///
/// # Examples
///
/// ```
/// use call_engine::{CallEngineError, Result};
///
/// fn check(agent_id: &str) -> Result<()> {
///     if agent_id.is_empty() {
///         return Err(CallEngineError::invalid_event("agent id is empty"));
///     }
///     Ok(())
/// }
///
/// match check("") {
///     Err(CallEngineError::InvalidEvent(msg)) => println!("skipped: {}", msg),
///     other => println!("{:?}", other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum CallEngineError {
    /// Agent pool store failures
    ///
    /// Raised when the shared list backing the agent pool cannot be read or
    /// mutated (Redis unreachable, script errors, wrong key type).
    #[error("Agent pool error: {0}")]
    Pool(String),

    /// Event stream failures
    ///
    /// Publishing, subscribing, or reading from the broker failed. A publish
    /// failure is fatal to the event being processed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// System of record failures
    #[error("Database error: {0}")]
    Database(String),

    /// An assigned call with this call id is already recorded
    ///
    /// Produced on unique-constraint violations, which is what a redelivered
    /// inbound call looks like from the store's point of view.
    #[error("Duplicate call: {0}")]
    DuplicateCall(String),

    /// The requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller does not own the record it tried to change
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// A stream event could not be decoded or carries an unknown action
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Writing a frame to an agent connection failed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// The agent credential presented on connect is missing or invalid
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallEngineError {
    /// Create a new Pool error with the provided message
    pub fn pool<S: Into<String>>(msg: S) -> Self {
        Self::Pool(msg.into())
    }

    /// Create a new Broker error with the provided message
    pub fn broker<S: Into<String>>(msg: S) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a new Database error with the provided message
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new InvalidEvent error with the provided message
    pub fn invalid_event<S: Into<String>>(msg: S) -> Self {
        Self::InvalidEvent(msg.into())
    }

    /// Create a new Delivery error with the provided message
    pub fn delivery<S: Into<String>>(msg: S) -> Self {
        Self::Delivery(msg.into())
    }

    /// Create a new Authentication error with the provided message
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a data error that should be skipped, not retried
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::InvalidEvent(_))
    }
}

impl From<redis::RedisError> for CallEngineError {
    fn from(err: redis::RedisError) -> Self {
        Self::Pool(err.to_string())
    }
}

impl From<sqlx::Error> for CallEngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::DuplicateCall(db.message().to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CallEngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for CallEngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEvent(err.to_string())
    }
}

impl From<config::ConfigError> for CallEngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for CallEngineError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Result type for call distribution operations
pub type Result<T> = std::result::Result<T, CallEngineError>;
