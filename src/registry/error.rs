use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// No live node exists for the requested service.
    #[error("service not found")]
    NotFound,

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The etcd lease backing a registration has expired. Register recovers
    /// from this on its own; it is never returned from `register`.
    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by a remote registry behind the proxy API.
    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub(crate) fn require_nodes(op: &str) -> Self {
        RegistryError::InvalidArgument(format!("{} requires at least one node", op))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound)
    }

    /// Network or backend failure, as opposed to a caller error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RegistryError::Timeout(_)
                | RegistryError::Etcd(_)
                | RegistryError::Http(_)
                | RegistryError::Transport(_)
                | RegistryError::Backend { .. }
        )
    }
}
