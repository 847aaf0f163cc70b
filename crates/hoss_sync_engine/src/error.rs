//! Error types for the sync engine.

use hoss_policy::PolicyError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while running the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A core service answered with a status the call does not accept.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A response or queue body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// No usable service token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Object storage operation failed.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// The endpoint is not one of the monitored core services.
    #[error("unknown core service {0}")]
    UnknownCoreService(String),

    /// The namespace does not exist on the core service.
    #[error("unknown namespace {namespace} on {core_service}")]
    UnknownNamespace {
        /// Core service endpoint.
        core_service: String,
        /// Namespace name.
        namespace: String,
    },

    /// The object store is not registered with the core service.
    #[error("unknown object store {name} on {core_service}")]
    UnknownObjectStore {
        /// Core service endpoint.
        core_service: String,
        /// Object store name.
        name: String,
    },

    /// Policy document error.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Invalid static configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine is shutting down.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else if err.is_builder() {
            SyncError::transport_fatal(err.to_string())
        } else {
            SyncError::transport_retryable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
