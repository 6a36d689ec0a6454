//! Error types shared by every component of the sync node.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error categories, used to pick a log level and a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Security,
    Persistence,
    Filesystem,
    Configuration,
    Internal,
}

/// Severity used by callers deciding which tracing level to emit at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCategory {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Security => ErrorSeverity::Critical,
            Self::Network | Self::Persistence => ErrorSeverity::High,
            Self::Filesystem => ErrorSeverity::Medium,
            Self::Configuration => ErrorSeverity::High,
            Self::Internal => ErrorSeverity::Medium,
        }
    }
}

/// Node-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("operation cancelled")]
    Cancelled,

    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("connect io error: {0}")]
    ConnectIo(#[from] std::io::Error),

    #[error("handshake signature invalid for peer {peer_id}")]
    HandshakeSignatureInvalid { peer_id: String },

    #[error("handshake protocol error: {0}")]
    HandshakeProtocol(String),

    #[error("connection pool exhausted for peer {peer_key}")]
    PoolExhausted { peer_key: String },

    #[error("persistence io error: {0}")]
    PersistenceIo(String),

    #[error("hash io error for {path}: {source}")]
    HashIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Category used for log-level selection and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Internal,
            Self::ConnectTimeout { .. } | Self::ConnectIo(_) => ErrorCategory::Network,
            Self::HandshakeSignatureInvalid { .. } => ErrorCategory::Security,
            Self::HandshakeProtocol(_) => ErrorCategory::Network,
            Self::PoolExhausted { .. } => ErrorCategory::Network,
            Self::PersistenceIo(_) => ErrorCategory::Persistence,
            Self::HashIo { .. } => ErrorCategory::Filesystem,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Unexpected(_) => ErrorCategory::Internal,
        }
    }

    /// Severity derived from category, mirroring the node's logger.
    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }
}
