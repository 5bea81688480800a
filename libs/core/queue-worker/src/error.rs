//! Error types for the queue worker framework
//!
//! Errors are split by concern so that callers can tell a configuration
//! mistake from a transport hiccup or a fault reported by a remote worker:
//! - **MarshalError**: codec lookup, registration and encode/decode failures
//! - **TransportError**: backend failures, classified transient or permanent
//! - **ProcessingError**: faults raised by application logic
//! - **WorkerError**: worker setup and consume-loop failures
//! - **PublishError**: failures while publishing a message
//! - **ResponseError**: failures while reading correlated replies

use crate::envelope::RemoteException;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry with exponential backoff
    Transient,
    /// Unrecoverable error - give up
    Permanent,
}

impl ErrorCategory {
    /// Base delay in milliseconds before the first retry
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 1000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Calculate exponential backoff delay for given retry count, capped at `max_ms`
    pub fn backoff_delay_ms(&self, retry_count: u32, max_ms: u64) -> u64 {
        if *self == ErrorCategory::Permanent {
            return 0;
        }

        let delay = self.base_delay_ms() * 2u64.saturating_pow(retry_count);
        delay.min(max_ms)
    }
}

/// Marshal registry and codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// No codec registered under this name
    #[error("Unknown marshal strategy: {0}")]
    UnknownStrategy(String),

    /// Codec rejected at registration time
    #[error("Invalid marshal strategy '{name}': {reason}")]
    InvalidStrategy { name: String, reason: String },

    /// Object could not be encoded
    #[error("Failed to marshal with '{strategy}': {details}")]
    Encode { strategy: String, details: String },

    /// Payload could not be decoded
    #[error("Failed to unmarshal with '{strategy}': {details}")]
    Decode { strategy: String, details: String },
}

impl MarshalError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        MarshalError::InvalidStrategy {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn encode(strategy: impl Into<String>, details: impl ToString) -> Self {
        MarshalError::Encode {
            strategy: strategy.into(),
            details: details.to_string(),
        }
    }

    pub fn decode(strategy: impl Into<String>, details: impl ToString) -> Self {
        MarshalError::Decode {
            strategy: strategy.into(),
            details: details.to_string(),
        }
    }
}

/// Transport backend errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Consumer, producer or reply destination already closed
    #[error("Transport closed: {0}")]
    Closed(String),

    /// Destination cannot be used for the requested operation
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Envelope could not be written to or read from the wire
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl TransportError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Redis(e)
                if e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout() =>
            {
                ErrorCategory::Transient
            }
            TransportError::Redis(_) => ErrorCategory::Permanent,
            TransportError::Closed(_) => ErrorCategory::Permanent,
            TransportError::InvalidDestination(_) => ErrorCategory::Permanent,
            TransportError::Encoding(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encoding(err.to_string())
    }
}

/// Faults raised while handling one message
///
/// These never stop a worker. They are counted, logged, dead-lettered when
/// configured and reported to the requester as a remote exception.
#[derive(Error, Debug, Clone)]
pub enum ProcessingError {
    /// The payload could not be turned into the processor's request type
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Application logic failed
    #[error("{message}")]
    Failed { kind: String, message: String },
}

impl ProcessingError {
    /// Create a generic application failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_kind("ProcessingError", message)
    }

    /// Create an application failure with an explicit kind shown to requesters
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessingError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Short name of the fault, carried in remote exceptions
    pub fn kind(&self) -> &str {
        match self {
            ProcessingError::InvalidRequest(_) => "InvalidRequest",
            ProcessingError::Failed { kind, .. } => kind,
        }
    }
}

impl From<MarshalError> for ProcessingError {
    fn from(err: MarshalError) -> Self {
        ProcessingError::InvalidRequest(err.to_string())
    }
}

/// Worker setup and consume-loop errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Invalid worker definition or options
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `run` called on a worker that already left the created phase
    #[error("Worker {0} already started")]
    AlreadyStarted(String),
}

impl WorkerError {
    pub fn config(message: impl Into<String>) -> Self {
        WorkerError::Config(message.into())
    }
}

/// Publishing errors
#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Object could not be converted to the codec object model
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

/// Errors while reading correlated replies
///
/// Timeouts are not errors; they are reported as values or through timeout
/// handlers.
#[derive(Error, Debug)]
pub enum ResponseError {
    /// A worker reported a fault for this request
    #[error("Remote exception from {worker}: {exception}")]
    Remote {
        worker: String,
        exception: RemoteException,
    },

    /// Multi-reply read started without any `on_message` registration
    #[error("No message handlers registered for read_responses")]
    NoHandlers,

    /// Reply payload did not match the expected type
    #[error("Failed to decode reply: {0}")]
    Decode(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        ResponseError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(0, 30_000), 1000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1, 30_000), 2000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(2, 30_000), 4000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(10, 30_000), 30_000);
        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(3, 30_000), 0);
    }

    #[test]
    fn test_transport_error_categories() {
        assert!(!TransportError::Closed("consumer".into()).is_transient());
        assert!(!TransportError::Encoding("bad".into()).is_transient());

        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(TransportError::Redis(io).is_transient());
    }

    #[test]
    fn test_processing_error_kind() {
        assert_eq!(ProcessingError::failed("boom").kind(), "ProcessingError");
        assert_eq!(
            ProcessingError::with_kind("DivideByZero", "boom").kind(),
            "DivideByZero"
        );
        assert_eq!(
            ProcessingError::InvalidRequest("x".into()).kind(),
            "InvalidRequest"
        );
        assert_eq!(ProcessingError::failed("boom").to_string(), "boom");
    }

    #[test]
    fn test_marshal_error_messages() {
        let err = MarshalError::UnknownStrategy("yaml".into());
        assert_eq!(err.to_string(), "Unknown marshal strategy: yaml");

        let err = MarshalError::invalid("broken", "missing unmarshal");
        assert!(err.to_string().contains("broken"));
        assert!(err.to_string().contains("missing unmarshal"));
    }
}
