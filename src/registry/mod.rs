pub mod announce;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod options;
pub mod proxy;
pub mod types;


use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;

pub use error::{RegistryError, Result};
pub use options::{Credentials, Options, RegisterOptions, TlsConfig, WatchOptions};
pub use types::{Action, Endpoint, Event, Node, RegistryResult, Service, Value};

#[async_trait]
pub trait Registry: Send + Sync {
    /// Apply new options to the registry
    async fn init(&self, options: Options) -> Result<()>;

    async fn options(&self) -> Options;

    /// Register the nodes of a service
    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<()>;

    /// Deregister the nodes of a service
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// All versions of a service that have at least one live node
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Subscribe to registry changes
    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>>;

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next change. Returns `WatcherStopped` once stopped.
    async fn next(&mut self) -> Result<RegistryResult>;

    /// Stop the watcher. Calling it more than once is harmless.
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Memory,
    Etcd,
    Proxy,
}

impl FromStr for RegistryKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(RegistryKind::Memory),
            "etcd" => Ok(RegistryKind::Etcd),
            "proxy" | "service" => Ok(RegistryKind::Proxy),
            other => Err(RegistryError::Config(format!("unknown registry backend: {}", other))),
        }
    }
}

/// Build a registry backend. Must be called from within a tokio runtime.
pub async fn new_registry(kind: RegistryKind, options: Options) -> Result<Arc<dyn Registry>> {
    let registry: Arc<dyn Registry> = match kind {
        RegistryKind::Memory => Arc::new(memory::MemoryRegistry::new(options)),
        RegistryKind::Etcd => Arc::new(etcd::EtcdRegistry::connect(options).await?),
        #[cfg(feature = "client")]
        RegistryKind::Proxy => Arc::new(proxy::client::ProxyRegistry::new(options)?),
        #[cfg(not(feature = "client"))]
        RegistryKind::Proxy => {
            return Err(RegistryError::Config(
                "proxy registry requires the client feature".to_string(),
            ))
        }
    };
    Ok(registry)
}
