// KeyQuarry - in-memory key/value server
// Per-key locking, revision history, TTL expiry, capacity pruning,
// event streaming and encrypted rotating snapshots.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod event;
pub mod network;
pub mod server;
pub mod snapshot;
pub mod store;

// Re-exports for convenience
pub use config::ServerConfig;
pub use event::{Event, EventBus, EventKind};
pub use store::{Kernel, KernelStats};

/// KeyQuarry error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("invalid argument: {0}")]
        InvalidArgument(String),

        #[error("not found: {0}")]
        NotFound(String),

        #[error("already exists: {0}")]
        AlreadyExists(String),

        #[error("locked: {0}")]
        Locked(String),

        #[error("readonly mode: {0}")]
        ReadOnly(String),

        #[error("capacity exhausted: {0}")]
        CapacityExhausted(String),

        #[error("permission denied: {0}")]
        PermissionDenied(String),

        #[error("cancelled: {0}")]
        Cancelled(String),

        #[error("internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Stable kind name carried over the wire
        pub fn kind(&self) -> &'static str {
            match self {
                Error::InvalidArgument(_) => "invalid_argument",
                Error::NotFound(_) => "not_found",
                Error::AlreadyExists(_) => "already_exists",
                Error::Locked(_) => "locked",
                Error::ReadOnly(_) => "readonly",
                Error::CapacityExhausted(_) => "capacity_exhausted",
                Error::PermissionDenied(_) => "permission_denied",
                Error::Cancelled(_) => "cancelled",
                Error::Internal(_) => "internal",
            }
        }
    }

    impl From<std::io::Error> for Error {
        fn from(e: std::io::Error) -> Self {
            Error::Internal(e.to_string())
        }
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::Internal(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default prefix for reserved key names
pub const DEFAULT_RESERVED_PREFIX: &str = "keyquarry/";
