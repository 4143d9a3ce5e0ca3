//! Error types for peercache operations

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Path is not a directory: {path:?}")]
    NotADirectory { path: PathBuf },

    #[error("Unknown service discovery method: {method} (allowed methods are: dns, static)")]
    UnknownDiscoveryMethod { method: String },
}

/// Filesystem watch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("Failed to open filesystem event source: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Filesystem event source closed unexpectedly")]
    SourceClosed,

    #[error("Failed to register {path:?} with the event source: {reason}")]
    RegisterFailed { path: PathBuf, reason: String },

    #[error("Failed to read directory {path:?}: {reason}")]
    ReadDirFailed { path: PathBuf, reason: String },

    #[error("Watcher lock poisoned")]
    LockPoisoned,

    #[error("Watcher task failed: {reason}")]
    TaskFailed { reason: String },
}

/// Service discovery errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Failed to resolve {domain}: {reason}")]
    Resolution { domain: String, reason: String },
}

/// Peer dial errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("Invalid dial target for peer {address}: {reason}")]
    InvalidTarget { address: String, reason: String },

    #[error("Failed to connect to peer {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Gave up dialing peer {address} after {attempts} attempts: {last_error}")]
    Exhausted {
        address: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Dialing peer {address} was cancelled")]
    Cancelled { address: String },
}

/// Classification of a failed RPC, independent of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    /// The remote does not implement the method.
    Unimplemented,
    /// The remote could not be reached or dropped the connection.
    Unavailable,
    /// The call exceeded its deadline.
    DeadlineExceeded,
    /// Anything else reported by the remote.
    Other,
}

impl RpcErrorKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcErrorKind::Unimplemented => "unimplemented",
            RpcErrorKind::Unavailable => "unavailable",
            RpcErrorKind::DeadlineExceeded => "deadline_exceeded",
            RpcErrorKind::Other => "other",
        }
    }
}

/// Per-call RPC error. Always recoverable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("RPC {method} failed ({}): {message}", .kind.as_str())]
pub struct RpcError {
    pub method: String,
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(method: impl Into<String>, kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        self.kind == RpcErrorKind::Unimplemented
    }
}

/// Master error type for all peercache errors.
#[derive(Debug, Clone, Error)]
pub enum PeerCacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Server error: {reason}")]
    Server { reason: String },
}

impl PeerCacheError {
    pub fn server(reason: impl Into<String>) -> Self {
        PeerCacheError::Server {
            reason: reason.into(),
        }
    }
}

/// Result type alias for peercache operations.
pub type PeerCacheResult<T> = Result<T, PeerCacheError>;

// =============================================================================
// TESTS
// =============================================================================
