use local_ip_address::local_ip;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::options::DEFAULT_REGISTER_TTL;
use super::{Node, RegisterOptions, Registry, RegistryError, Result, Service};

/// Node for this process listening on `port`, addressed by the local IP.
pub fn local_node(service_name: &str, port: u16, metadata: BTreeMap<String, String>) -> Result<Node> {
    let ip = local_ip().map_err(|e| RegistryError::Config(format!("no local ip address: {}", e)))?;
    Ok(Node {
        id: format!("{}-{}", service_name, Uuid::new_v4()),
        address: format!("{}:{}", ip, port),
        metadata,
    })
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps a service registered for as long as it runs by re-registering it
/// on a fixed interval shorter than its TTL.
pub struct Announcer {
    registry: Arc<dyn Registry>,
    service: Service,
    ttl: Duration,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Announcer {
    /// `interval` defaults to a third of the TTL.
    pub fn new(
        registry: Arc<dyn Registry>,
        service: Service,
        ttl: Duration,
        interval: Option<Duration>,
    ) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_REGISTER_TTL } else { ttl };
        let interval = interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(ttl / 3)
            .max(Duration::from_millis(1));
        Self {
            registry,
            service,
            ttl,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let opts = RegisterOptions::with_ttl(self.ttl);
        match self.registry.register(&self.service, opts.clone()).await {
            Ok(_) => info!("Service {} registered successfully", self.service.name),
            Err(e) => {
                error!("Failed to register service {}: {}", self.service.name, e);
                return Err(e);
            }
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let service = self.service.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.register(&service, opts.clone()).await {
                            Ok(_) => debug!("Refreshed registration of {}", service.name),
                            Err(e) => error!("Failed to refresh service {}: {}", service.name, e),
                        }
                    }
                    changed = stop_rx.changed() => {
                        let stop = changed.is_err() || *stop_rx.borrow();
                        if stop {
                            break;
                        }
                    }
                }
            }
        });

        *running = Some(Running { stop, handle });
        Ok(())
    }

    /// Stop refreshing and deregister the service. Does nothing if not started.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.stop.send_replace(true);
        if let Err(e) = running.handle.await {
            error!("Announcer task for {} failed: {}", self.service.name, e);
        }

        self.registry.deregister(&self.service).await?;
        info!("Service {} deregistered", self.service.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::{MemoryRegistry, TTL_PRUNE_INTERVAL};
    use crate::registry::Options;
    use tokio::time::sleep;

    fn setup() -> (Arc<dyn Registry>, Service) {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(Options::default()));
        let service = Service::new("announced", "0.1.0").with_node(Node::new("announced-1", "127.0.0.1:7300"));
        (registry, service)
    }

    #[test]
    fn test_default_interval_is_third_of_ttl() {
        let registry: Arc<dyn Registry> = Arc::new(NoopRegistry);
        let announcer = Announcer::new(registry, Service::new("a", "1"), Duration::from_secs(30), None);
        assert_eq!(announcer.interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_deregisters() {
        let (registry, service) = setup();
        let announcer = Announcer::new(registry.clone(), service, Duration::from_secs(30), None);

        announcer.start().await.unwrap();
        assert_eq!(registry.get_service("announced").await.unwrap().len(), 1);

        announcer.stop().await.unwrap();
        assert!(registry.get_service("announced").await.unwrap_err().is_not_found());
        announcer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_outlives_ttl() {
        let (registry, service) = setup();
        let ttl = Duration::from_secs(1);
        let announcer =
            Announcer::new(registry.clone(), service, ttl, Some(Duration::from_millis(200)));

        announcer.start().await.unwrap();
        sleep(ttl + TTL_PRUNE_INTERVAL * 2).await;
        assert_eq!(registry.get_service("announced").await.unwrap()[0].nodes.len(), 1);

        announcer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_reports_register_failure() {
        let (registry, _) = setup();
        let announcer = Announcer::new(registry, Service::new("empty", "1"), Duration::from_secs(5), None);

        assert!(matches!(
            announcer.start().await,
            Err(RegistryError::InvalidArgument(_))
        ));
        announcer.stop().await.unwrap();
    }

    #[test]
    fn test_local_node_address() {
        if let Ok(node) = local_node("svc", 7300, BTreeMap::new()) {
            assert!(node.id.starts_with("svc-"));
            assert!(node.address.ends_with(":7300"));
        }
    }

    struct NoopRegistry;

    #[async_trait::async_trait]
    impl Registry for NoopRegistry {
        async fn init(&self, _options: Options) -> Result<()> {
            Ok(())
        }

        async fn options(&self) -> Options {
            Options::default()
        }

        async fn register(&self, _service: &Service, _opts: RegisterOptions) -> Result<()> {
            Ok(())
        }

        async fn deregister(&self, _service: &Service) -> Result<()> {
            Ok(())
        }

        async fn get_service(&self, _name: &str) -> Result<Vec<Service>> {
            Err(RegistryError::NotFound)
        }

        async fn list_services(&self) -> Result<Vec<Service>> {
            Ok(vec![])
        }

        async fn watch(&self, _opts: crate::registry::WatchOptions) -> Result<Box<dyn crate::registry::Watcher>> {
            Err(RegistryError::WatcherStopped)
        }

        fn name(&self) -> &'static str {
            "noop"
        }
    }
}
