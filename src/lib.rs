//! Service registry: named, versioned services and the nodes serving them,
//! kept in memory, in etcd, or behind a remote HTTP proxy.

pub mod config;
pub mod registry;
pub mod utils;

pub use config::{init_env, REGISTRY_BACKEND, REGISTRY_HTTP_ADDR, REGISTRY_LOG_DIR, REGISTRY_TTL};
pub use registry::{
    new_registry, Action, Event, Node, Options, RegisterOptions, Registry, RegistryError,
    RegistryKind, RegistryResult, Service, WatchOptions, Watcher,
};
