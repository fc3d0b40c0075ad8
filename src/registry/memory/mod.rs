//! In-memory registry.
//!
//! Records live in a single map guarded by one read-write lock. Liveness is
//! enforced by a background loop that periodically drops nodes whose TTL has
//! elapsed since they were last registered, instead of one timer per node.

mod watcher;


pub use watcher::{MemoryWatcher, WATCHER_BUFFER};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Action, Endpoint, Node, Options, RegisterOptions, Registry, RegistryError, RegistryResult,
    Result, Service, WatchOptions, Watcher,
};
use watcher::WatcherSlot;

/// How often expired nodes are swept out.
pub const TTL_PRUNE_INTERVAL: Duration = Duration::from_millis(500);

struct NodeEntry {
    node: Node,
    ttl: Duration,
    last_seen: Instant,
}

impl NodeEntry {
    fn is_expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.last_seen) > self.ttl
    }
}

/// Internal state of one (name, version) pair.
struct Record {
    name: String,
    version: String,
    metadata: BTreeMap<String, String>,
    endpoints: Vec<Endpoint>,
    nodes: HashMap<String, NodeEntry>,
}

impl Record {
    fn from_service(service: &Service, ttl: Duration) -> Self {
        let now = Instant::now();
        let nodes = service
            .nodes
            .iter()
            .map(|node| {
                let entry = NodeEntry {
                    node: node.clone(),
                    ttl,
                    last_seen: now,
                };
                (node.id.clone(), entry)
            })
            .collect();

        Self {
            name: service.name.clone(),
            version: service.version.clone(),
            metadata: service.metadata.clone(),
            endpoints: service.endpoints.clone(),
            nodes,
        }
    }

    /// Merge a registration into the record. Returns whether anything other
    /// than the liveness clock changed.
    fn refresh(&mut self, service: &Service, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut changed = false;

        for (key, value) in &service.metadata {
            if self.metadata.get(key) != Some(value) {
                self.metadata.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        for endpoint in &service.endpoints {
            match self.endpoints.iter_mut().find(|e| e.name == endpoint.name) {
                Some(existing) if existing == endpoint => {}
                Some(existing) => {
                    *existing = endpoint.clone();
                    changed = true;
                }
                None => {
                    self.endpoints.push(endpoint.clone());
                    changed = true;
                }
            }
        }

        for node in &service.nodes {
            match self.nodes.get_mut(&node.id) {
                Some(entry) => {
                    if entry.node != *node {
                        entry.node = node.clone();
                        changed = true;
                    }
                    entry.ttl = ttl;
                    entry.last_seen = now;
                }
                None => {
                    let entry = NodeEntry {
                        node: node.clone(),
                        ttl,
                        last_seen: now,
                    };
                    self.nodes.insert(node.id.clone(), entry);
                    changed = true;
                }
            }
        }

        changed
    }

    fn header(&self, mut nodes: Vec<Node>) -> Service {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Service {
            name: self.name.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone(),
            nodes,
            ttl: None,
        }
    }

    fn to_service(&self) -> Service {
        self.header(self.nodes.values().map(|entry| entry.node.clone()).collect())
    }
}

type Records = HashMap<String, HashMap<String, Record>>;

fn seed(records: &mut Records, services: &HashMap<String, Vec<Service>>) {
    for service in services.values().flatten() {
        let versions = records.entry(service.name.clone()).or_default();
        match versions.get_mut(&service.version) {
            Some(record) => {
                record.refresh(service, Duration::ZERO);
            }
            None => {
                versions.insert(
                    service.version.clone(),
                    Record::from_service(service, Duration::ZERO),
                );
            }
        }
    }
}

struct Inner {
    options: RwLock<Options>,
    records: RwLock<Records>,
    watchers: Mutex<HashMap<Uuid, WatcherSlot>>,
}

impl Inner {
    async fn release(&self, id: Uuid) {
        if self.watchers.lock().await.remove(&id).is_some() {
            debug!("Released watcher {}", id);
        }
    }

    async fn notify(&self, result: &RegistryResult) {
        let mut watchers = self.watchers.lock().await;
        watcher::notify(&mut watchers, result);
    }

    async fn prune(&self) {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let mut results = Vec::new();

        for (name, versions) in records.iter_mut() {
            for record in versions.values_mut() {
                let expired: Vec<String> = record
                    .nodes
                    .iter()
                    .filter(|(_, entry)| entry.is_expired(now))
                    .map(|(id, _)| id.clone())
                    .collect();
                if expired.is_empty() {
                    continue;
                }

                let mut nodes = Vec::with_capacity(expired.len());
                for id in expired {
                    if let Some(entry) = record.nodes.remove(&id) {
                        debug!("Registry TTL expired for node {} of service {}", id, name);
                        nodes.push(entry.node);
                    }
                }
                results.push(RegistryResult::new(Action::Delete, record.header(nodes)));
            }
            versions.retain(|_, record| !record.nodes.is_empty());
        }
        records.retain(|_, versions| !versions.is_empty());

        let mut watchers = self.watchers.lock().await;
        watcher::release_stopped(&mut watchers);
        for result in &results {
            watcher::notify(&mut watchers, result);
        }
    }
}

pub struct MemoryRegistry {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    release: mpsc::UnboundedSender<Uuid>,
}

impl MemoryRegistry {
    /// Create the registry and start its prune loop on the current runtime.
    pub fn new(options: Options) -> Self {
        let mut records = Records::new();
        seed(&mut records, &options.services);

        let inner = Arc::new(Inner {
            options: RwLock::new(options),
            records: RwLock::new(records),
            watchers: Mutex::new(HashMap::new()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (release, release_rx) = mpsc::unbounded_channel();
        spawn_prune_loop(Arc::clone(&inner), shutdown_rx, release_rx);

        Self {
            inner,
            shutdown,
            release,
        }
    }

    /// Remove every node whose TTL has elapsed and release stopped watchers.
    /// The prune loop calls this on each tick.
    pub async fn prune_expired(&self) {
        self.inner.prune().await;
    }

    /// Stop the prune loop. Registered state stays readable.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().await.len()
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_prune_loop(
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
    mut release: mpsc::UnboundedReceiver<Uuid>,
) {
    tokio::spawn(async move {
        let mut ticker = interval(TTL_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => inner.prune().await,
                Some(id) = release.recv() => inner.release(id).await,
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        debug!("Stopping registry prune loop");
                        break;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn init(&self, options: Options) -> Result<()> {
        {
            let mut records = self.inner.records.write().await;
            seed(&mut records, &options.services);
        }
        *self.inner.options.write().await = options;
        Ok(())
    }

    async fn options(&self) -> Options {
        self.inner.options.read().await.clone()
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("register"));
        }
        let ttl = opts.resolve_ttl(service);

        let mut records = self.inner.records.write().await;
        let versions = records.entry(service.name.clone()).or_default();

        let result = match versions.get_mut(&service.version) {
            None => {
                let record = Record::from_service(service, ttl);
                let snapshot = record.to_service();
                versions.insert(service.version.clone(), record);
                info!(
                    "Registry added new service: {}, version: {}",
                    service.name, service.version
                );
                Some(RegistryResult::new(Action::Create, snapshot))
            }
            Some(record) => {
                if record.refresh(service, ttl) {
                    info!(
                        "Registry updated service: {}, version: {}",
                        service.name, service.version
                    );
                    Some(RegistryResult::new(Action::Update, record.to_service()))
                } else {
                    debug!(
                        "Registry refreshed service: {}, version: {}",
                        service.name, service.version
                    );
                    None
                }
            }
        };

        if let Some(result) = result {
            self.inner.notify(&result).await;
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("deregister"));
        }

        let mut records = self.inner.records.write().await;
        let Some(versions) = records.get_mut(&service.name) else {
            return Ok(());
        };
        let Some(record) = versions.get_mut(&service.version) else {
            return Ok(());
        };

        let removed: Vec<Node> = service
            .nodes
            .iter()
            .filter_map(|node| record.nodes.remove(&node.id))
            .map(|entry| entry.node)
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        for node in &removed {
            info!(
                "Registry removed node {} from service: {}, version: {}",
                node.id, service.name, service.version
            );
        }

        let result = RegistryResult::new(Action::Delete, record.header(removed));
        if record.nodes.is_empty() {
            versions.remove(&service.version);
            info!(
                "Registry removed service: {}, version: {}",
                service.name, service.version
            );
        }
        if versions.is_empty() {
            records.remove(&service.name);
        }

        self.inner.notify(&result).await;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let records = self.inner.records.read().await;
        let mut services: Vec<Service> = records
            .get(name)
            .map(|versions| {
                versions
                    .values()
                    .filter(|record| !record.nodes.is_empty())
                    .map(Record::to_service)
                    .collect()
            })
            .unwrap_or_default();

        if services.is_empty() {
            return Err(RegistryError::NotFound);
        }
        services.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let records = self.inner.records.read().await;
        let mut services: Vec<Service> = records
            .values()
            .flat_map(|versions| versions.values())
            .filter(|record| !record.nodes.is_empty())
            .map(Record::to_service)
            .collect();

        services.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        Ok(services)
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>> {
        let (slot, watcher) = watcher::channel(opts, self.release.clone());
        self.inner.watchers.lock().await.insert(watcher.id(), slot);
        Ok(Box::new(watcher))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
