//! etcd-backed registry.
//!
//! Every node is stored under its own key, `/<namespace>/registry/<service>/<node>`,
//! holding the service record restricted to that node and attached to a
//! lease with the registration TTL. Expiry is left to etcd.

pub mod kv;
mod watcher;


pub use kv::{EtcdKv, KeyValue, KvBackend, KvEvent, KvEventKind, WatchEvents};
pub use watcher::EtcdWatcher;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::options::DEFAULT_REGISTER_TTL;
use super::types::{hash_bytes, merge_by_version};
use super::{
    Node, Options, RegisterOptions, Registry, RegistryError, Result, Service, WatchOptions,
    Watcher,
};

/// Lease and content hash last written for a node key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseEntry {
    lease: i64,
    hash: String,
}

#[derive(Clone)]
pub struct EtcdRegistry {
    kv: Arc<RwLock<Arc<dyn KvBackend>>>,
    options: Arc<RwLock<Options>>,
    leases: Arc<Mutex<HashMap<String, LeaseEntry>>>,
}

/// Backend, key prefix and deadline captured for the duration of one call.
struct CallContext {
    kv: Arc<dyn KvBackend>,
    prefix: String,
    timeout: Duration,
}

impl CallContext {
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RegistryError::Timeout(self.timeout))?
    }

    fn service_prefix(&self, service_name: &str) -> String {
        format!("{}{}/", self.prefix, service_name.replace('/', "-"))
    }

    fn get_service_key(&self, service_name: &str, node_id: &str) -> String {
        format!("{}{}", self.service_prefix(service_name), node_id.replace('/', "-"))
    }
}

/// Root of all registry keys for a namespace, with a trailing slash.
pub fn registry_prefix(namespace: &str) -> String {
    let namespace = namespace.trim_matches('/');
    if namespace.is_empty() {
        "/registry/".to_string()
    } else {
        format!("/{}/registry/", namespace)
    }
}

fn decode_all(kvs: &[KeyValue]) -> Vec<Service> {
    kvs.iter()
        .filter_map(|kv| match Service::decode(&kv.value) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!("Skipping undecodable registry value at {}: {}", kv.key, e);
                None
            }
        })
        .collect()
}

impl EtcdRegistry {
    /// Connect to the etcd cluster named in `options`.
    pub async fn connect(options: Options) -> Result<Self> {
        let kv = EtcdKv::connect(&options).await?;
        Ok(Self::with_backend(Arc::new(kv), options))
    }

    pub fn with_backend(kv: Arc<dyn KvBackend>, options: Options) -> Self {
        Self {
            kv: Arc::new(RwLock::new(kv)),
            options: Arc::new(RwLock::new(options)),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn context(&self) -> CallContext {
        let options = self.options.read().await;
        CallContext {
            kv: Arc::clone(&*self.kv.read().await),
            prefix: registry_prefix(&options.namespace),
            timeout: options.timeout,
        }
    }

    async fn cached_lease(&self, ctx: &CallContext, key: &str) -> Result<Option<LeaseEntry>> {
        if let Some(entry) = self.leases.lock().await.get(key) {
            return Ok(Some(entry.clone()));
        }

        // Nothing cached, e.g. after a restart: recover the lease from etcd.
        let Some(kv) = ctx.call(ctx.kv.get(key)).await? else {
            return Ok(None);
        };
        if kv.lease <= 0 {
            return Ok(None);
        }
        let stored = match Service::decode(&kv.value) {
            Ok(stored) if !stored.nodes.is_empty() => stored,
            _ => return Ok(None),
        };

        let entry = LeaseEntry {
            lease: kv.lease,
            hash: stored.content_hash()?,
        };
        self.leases.lock().await.insert(key.to_string(), entry.clone());
        debug!("Recovered lease {} for {}", entry.lease, key);
        Ok(Some(entry))
    }

    async fn register_node(
        &self,
        ctx: &CallContext,
        service: &Service,
        node: &Node,
        ttl: Duration,
    ) -> Result<()> {
        let key = ctx.get_service_key(&service.name, &node.id);
        let value = service.with_nodes(vec![node.clone()]).encode()?;
        let hash = hash_bytes(&value);

        let cached = self.cached_lease(ctx, &key).await?;

        let mut lease_alive = false;
        if let Some(entry) = &cached {
            match ctx.call(ctx.kv.keep_alive_once(entry.lease)).await {
                Ok(()) => lease_alive = true,
                Err(RegistryError::LeaseNotFound(lease)) => {
                    debug!("Lease {} for {} is gone, registering again", lease, key);
                }
                Err(e) => return Err(e),
            }
        }

        if lease_alive && cached.as_ref().is_some_and(|entry| entry.hash == hash) {
            debug!(
                "Service {} node {} unchanged, skipping registration",
                service.name, node.id
            );
            return Ok(());
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let ttl_secs = if ttl_secs < 1 {
            debug!(
                "TTL {:?} for {} is below the etcd lease granularity, using 1s",
                ttl, key
            );
            1
        } else {
            ttl_secs
        };
        let lease = ctx.call(ctx.kv.grant(ttl_secs)).await?;
        ctx.call(ctx.kv.put(&key, value, Some(lease))).await?;

        self.leases.lock().await.insert(key, LeaseEntry { lease, hash });
        info!(
            "Registered service {} node {} to etcd with lease {} ({}s)",
            service.name, node.id, lease, ttl_secs
        );
        Ok(())
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn init(&self, options: Options) -> Result<()> {
        let kv = EtcdKv::connect(&options).await?;
        *self.kv.write().await = Arc::new(kv);
        *self.options.write().await = options;
        self.leases.lock().await.clear();
        Ok(())
    }

    async fn options(&self) -> Options {
        self.options.read().await.clone()
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("register"));
        }

        let ctx = self.context().await;
        let mut ttl = opts.resolve_ttl(service);
        if ttl.is_zero() {
            ttl = DEFAULT_REGISTER_TTL;
        }

        // Nodes are independent keys: keep going after a failure and report
        // the last one.
        let mut last_err = None;
        for node in &service.nodes {
            if let Err(e) = self.register_node(&ctx, service, node, ttl).await {
                error!(
                    "Failed to register service {} node {}: {}",
                    service.name, node.id, e
                );
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("deregister"));
        }

        let ctx = self.context().await;
        for node in &service.nodes {
            let key = ctx.get_service_key(&service.name, &node.id);
            self.leases.lock().await.remove(&key);

            ctx.call(ctx.kv.delete(&key)).await?;
            info!("Deregistered service {} node {} from etcd", service.name, node.id);
        }
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let ctx = self.context().await;
        let kvs = ctx.call(ctx.kv.get_prefix(&ctx.service_prefix(name))).await?;
        if kvs.is_empty() {
            return Err(RegistryError::NotFound);
        }

        let services = merge_by_version(decode_all(&kvs));
        if services.is_empty() {
            return Err(RegistryError::NotFound);
        }
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let ctx = self.context().await;
        let kvs = ctx.call(ctx.kv.get_prefix(&ctx.prefix)).await?;
        Ok(merge_by_version(decode_all(&kvs)))
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>> {
        let ctx = self.context().await;
        let prefix = if opts.service.is_empty() {
            ctx.prefix.clone()
        } else {
            ctx.service_prefix(&opts.service)
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let events = ctx.call(ctx.kv.watch_prefix(&prefix, cancel_rx)).await?;
        debug!("Watching etcd registry prefix {}", prefix);
        Ok(Box::new(EtcdWatcher::new(events, cancel)))
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}
