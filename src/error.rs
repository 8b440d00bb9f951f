//! Error types for the shared log core
//!
//! Errors fall into the classes the design distinguishes: fatal protocol
//! violations (broken invariants — the embedding process must abort), stale
//! traffic (ignored with a warning at the call site, not surfaced as
//! errors), transient I/O, and capacity pressure (surfaced as typed append
//! rejection).

use thiserror::Error;

use crate::types::{LogSpaceId, NodeId, SeqNum, Tag, ViewId};

/// Result type alias for shared log operations
pub type Result<T> = std::result::Result<T, SharedLogError>;

/// Structured wire/protocol error domain
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown op type: {0}")]
    UnknownOpType(u16),
    #[error("expected {expected}, got {got}")]
    Unexpected { expected: String, got: String },
}

impl ProtocolError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn unexpected(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Unexpected {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Structured configuration error domain
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

/// Main error type for the shared log core
#[derive(Debug, Error)]
pub enum SharedLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An invariant of the replication protocol is broken. The embedding
    /// process must treat this as fatal; the state machine cannot continue.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No view installed yet")]
    NoCurrentView,

    #[error("View {view_id} does not contain node {node_id}")]
    NotInView { view_id: ViewId, node_id: NodeId },

    #[error("Node {node_id} is not the primary of tag {tag} in view {view_id}")]
    NotPrimary {
        view_id: ViewId,
        node_id: NodeId,
        tag: Tag,
    },

    #[error("Pending entries at capacity ({limit}); append rejected")]
    PendingCapacityExceeded { limit: usize },

    #[error("Storage node {storage_id} does not serve engine {engine_id}")]
    NotSourceEngine {
        storage_id: NodeId,
        engine_id: NodeId,
    },

    #[error("Logspace {0:#010x} not found")]
    LogSpaceNotFound(LogSpaceId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Metadata service error: {0}")]
    Metadata(String),

    #[error("View error: {0}")]
    View(String),

    #[error("Record not found at seqnum {0:#018x}")]
    RecordNotFound(SeqNum),
}

impl SharedLogError {
    /// Create a fatal protocol-violation error
    pub fn violation(detail: impl Into<String>) -> Self {
        SharedLogError::ProtocolViolation(detail.into())
    }

    /// Create a wire protocol error with operation context
    pub fn protocol(operation: &str, detail: impl Into<String>) -> Self {
        SharedLogError::Protocol(ProtocolError::operation(operation, detail))
    }

    /// Create a storage error
    pub fn storage(detail: impl Into<String>) -> Self {
        SharedLogError::Storage(detail.into())
    }

    /// Create a metadata service error
    pub fn metadata(detail: impl Into<String>) -> Self {
        SharedLogError::Metadata(detail.into())
    }

    /// Create a view validation error
    pub fn view(detail: impl Into<String>) -> Self {
        SharedLogError::View(detail.into())
    }

    /// True if the error indicates a broken replication invariant. Drivers
    /// must escalate these to process-level fatal instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SharedLogError::ProtocolViolation(_))
    }
}
