// src/server/error.rs

use std::net::SocketAddr;

/// Invalid configuration, raised by `Server::new`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server name must not be empty")]
    EmptyName,

    #[error("unknown network type {0:?} (expected tcp, tcp4 or tcp6)")]
    UnknownNetType(String),

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("address {addr:?} does not belong to network type {net_type}")]
    FamilyMismatch { net_type: String, addr: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Lifecycle failures returned from `start` and `stop`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already listening")]
    AlreadyListening,

    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{addr} has no {net_type} address to listen on")]
    NoAddress { net_type: String, addr: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("accept loop terminated abnormally: {0}")]
    AcceptTask(#[from] tokio::task::JoinError),
}

impl ServerError {
    /// True for failures of a single start attempt that may succeed on retry.
    pub fn is_bind_error(&self) -> bool {
        matches!(
            self,
            ServerError::Resolve { .. } | ServerError::NoAddress { .. } | ServerError::Bind { .. }
        )
    }
}
