use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, PutOptions, TlsOptions,
    WatchOptions as EtcdWatchOptions,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::registry::{Options, RegistryError, Result, TlsConfig};

pub const DEFAULT_ADDR: &str = "http://127.0.0.1:2379";
const WATCH_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// A key change reported by a prefix watch.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: Vec<u8>,
    /// Value before the change, when the backend keeps it.
    pub prev_value: Option<Vec<u8>>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl KvEvent {
    pub fn is_create(&self) -> bool {
        self.kind == KvEventKind::Put && self.create_revision == self.mod_revision
    }
}

#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Attached lease, 0 when none.
    pub lease: i64,
}

/// Batches of events in the order the backend produced them. The sender side
/// closes when the watch ends.
pub type WatchEvents = mpsc::Receiver<Result<Vec<KvEvent>>>;

/// The subset of etcd the registry relies on.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn grant(&self, ttl_secs: i64) -> Result<i64>;

    /// Renew a lease once. Fails with `LeaseNotFound` if it has expired.
    async fn keep_alive_once(&self, lease: i64) -> Result<()>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Watch every key under `prefix`, including previous values on delete.
    /// The watch is released once `cancel` turns true or the receiver is dropped.
    async fn watch_prefix(&self, prefix: &str, cancel: watch::Receiver<bool>) -> Result<WatchEvents>;
}

/// [`KvBackend`] over a live etcd cluster.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    pub async fn connect(options: &Options) -> Result<Self> {
        let endpoints = if options.addrs.is_empty() {
            vec![DEFAULT_ADDR.to_string()]
        } else {
            options.addrs.clone()
        };

        let mut connect = ConnectOptions::new()
            .with_timeout(options.timeout)
            .with_connect_timeout(options.timeout);
        if let Some(credentials) = &options.credentials {
            connect = connect.with_user(credentials.username.clone(), credentials.password.clone());
        }
        if options.secure {
            connect = connect.with_tls(tls_options(options.tls.as_ref()).await?);
        }

        let client = Client::connect(endpoints.clone(), Some(connect)).await?;
        info!("Connected to etcd: {}", endpoints.join(","));
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

async fn tls_options(tls: Option<&TlsConfig>) -> Result<TlsOptions> {
    let mut options = TlsOptions::new();
    let Some(tls) = tls else {
        return Ok(options);
    };

    if let Some(ca) = &tls.ca_cert {
        options = options.ca_certificate(Certificate::from_pem(tokio::fs::read(ca).await?));
    }
    match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            let cert = tokio::fs::read(cert).await?;
            let key = tokio::fs::read(key).await?;
            options = options.identity(Identity::from_pem(cert, key));
        }
        (None, None) => {}
        _ => {
            return Err(RegistryError::Config(
                "client certificate and key must be set together".to_string(),
            ))
        }
    }
    if let Some(domain) = &tls.domain {
        options = options.domain_name(domain.clone());
    }
    Ok(options)
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => status.message().contains("lease not found"),
        _ => false,
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        lease: kv.lease(),
    }
}

fn to_event(event: &etcd_client::Event) -> Option<KvEvent> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => KvEventKind::Put,
        EventType::Delete => KvEventKind::Delete,
    };
    Some(KvEvent {
        kind,
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        prev_value: event.prev_kv().map(|prev| prev.value().to_vec()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    })
}

#[async_trait]
impl KvBackend for EtcdKv {
    async fn grant(&self, ttl_secs: i64) -> Result<i64> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease).await {
            Ok(pair) => pair,
            Err(e) if is_lease_not_found(&e) => return Err(RegistryError::LeaseNotFound(lease)),
            Err(e) => return Err(e.into()),
        };

        keeper.keep_alive().await?;
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => Ok(()),
            Ok(_) => Err(RegistryError::LeaseNotFound(lease)),
            Err(e) if is_lease_not_found(&e) => Err(RegistryError::LeaseNotFound(lease)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<i64>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let options = GetOptions::new().with_serializable();
        let resp = self.client.clone().get(key, Some(options)).await?;
        Ok(resp.kvs().first().map(to_key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let options = GetOptions::new().with_prefix().with_serializable();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        Ok(resp.kvs().iter().map(to_key_value).collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str, mut cancel: watch::Receiver<bool>) -> Result<WatchEvents> {
        let options = EtcdWatchOptions::new().with_prefix().with_prev_key();
        let (mut watcher, mut stream) = self.client.clone().watch(prefix, Some(options)).await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = cancel.changed() => {
                        let stop = changed.is_err() || *cancel.borrow();
                        if stop {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                let reason = format!("watch canceled: {}", resp.cancel_reason());
                                let _ = tx.send(Err(RegistryError::Transport(reason))).await;
                                break;
                            }
                            let events: Vec<KvEvent> = resp.events().iter().filter_map(to_event).collect();
                            if events.is_empty() {
                                continue;
                            }
                            if tx.send(Ok(events)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                    },
                }
            }

            if let Err(e) = watcher.cancel().await {
                debug!("Failed to cancel etcd watch on {}: {}", prefix, e);
            }
            debug!("Stopped etcd watch on {}", prefix);
        });

        Ok(rx)
    }
}
