use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use super::{
    DeregisterRequest, HttpResponse, RegisterRequest, DEREGISTER_PATH, REGISTER_PATH,
    SERVICES_PATH, WATCH_PATH,
};
use crate::registry::{
    Event, Options, RegisterOptions, Registry, RegistryError, RegistryResult, Result, Service,
    WatchOptions, Watcher,
};

pub const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:7200";

struct Target {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl Target {
    fn new(options: &Options) -> Result<Self> {
        let addr = options
            .addrs
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROXY_ADDR);
        let base = if addr.contains("://") {
            addr.to_string()
        } else if options.secure {
            format!("https://{}", addr)
        } else {
            format!("http://{}", addr)
        };
        let base = Url::parse(&base)
            .map_err(|e| RegistryError::Config(format!("invalid proxy address {}: {}", addr, e)))?;

        // No overall timeout on the client: watch responses are long-lived.
        let client = Client::builder().connect_timeout(options.timeout).build()?;
        Ok(Self {
            client,
            base,
            timeout: options.timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::Config(format!("proxy address {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// [`Registry`] backed by a remote registry API.
pub struct ProxyRegistry {
    target: RwLock<Target>,
    options: RwLock<Options>,
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> RegistryError {
    if e.is_timeout() {
        RegistryError::Timeout(timeout)
    } else {
        e.into()
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = match resp.json::<HttpResponse<String>>().await {
        Ok(body) => body.data,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound,
        StatusCode::BAD_REQUEST => RegistryError::InvalidArgument(message),
        _ => RegistryError::Backend {
            status: status.as_u16(),
            message,
        },
    })
}

async fn send<T: DeserializeOwned>(req: RequestBuilder, timeout: Duration) -> Result<T> {
    let resp = req
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_send_error(e, timeout))?;
    let resp = check_status(resp).await?;
    let body: HttpResponse<T> = resp.json().await.map_err(|e| map_send_error(e, timeout))?;
    Ok(body.data)
}

impl ProxyRegistry {
    pub fn new(options: Options) -> Result<Self> {
        let target = Target::new(&options)?;
        info!("Using registry proxy at {}", target.base);
        Ok(Self {
            target: RwLock::new(target),
            options: RwLock::new(options),
        })
    }
}

#[async_trait]
impl Registry for ProxyRegistry {
    async fn init(&self, options: Options) -> Result<()> {
        *self.target.write().await = Target::new(&options)?;
        *self.options.write().await = options;
        Ok(())
    }

    async fn options(&self) -> Options {
        self.options.read().await.clone()
    }

    async fn register(&self, service: &Service, opts: RegisterOptions) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("register"));
        }
        let target = self.target.read().await;
        let body = RegisterRequest {
            service: service.clone(),
            ttl_ms: Some(u64::try_from(opts.ttl.as_millis()).unwrap_or(u64::MAX)),
        };
        let req = target
            .client
            .post(target.url(&path_segments(REGISTER_PATH))?)
            .json(&body);
        send::<()>(req, target.timeout).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        if service.nodes.is_empty() {
            return Err(RegistryError::require_nodes("deregister"));
        }
        let target = self.target.read().await;
        let body = DeregisterRequest {
            service: service.clone(),
        };
        let req = target
            .client
            .post(target.url(&path_segments(DEREGISTER_PATH))?)
            .json(&body);
        send::<()>(req, target.timeout).await
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let target = self.target.read().await;
        let mut segments = path_segments(SERVICES_PATH);
        segments.push(name);
        let req = target.client.get(target.url(&segments)?);
        send(req, target.timeout).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let target = self.target.read().await;
        let req = target.client.get(target.url(&path_segments(SERVICES_PATH))?);
        send(req, target.timeout).await
    }

    async fn watch(&self, opts: WatchOptions) -> Result<Box<dyn Watcher>> {
        let target = self.target.read().await;
        let mut url = target.url(&path_segments(WATCH_PATH))?;
        if !opts.service.is_empty() {
            url.query_pairs_mut().append_pair("service", &opts.service);
        }

        let resp = tokio::time::timeout(target.timeout, target.client.get(url).send())
            .await
            .map_err(|_| RegistryError::Timeout(target.timeout))??;
        let resp = check_status(resp).await?;
        debug!("Opened registry watch stream for {:?}", opts.service);
        Ok(Box::new(ProxyWatcher::new(resp.bytes_stream())))
    }

    fn name(&self) -> &'static str {
        "proxy"
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Reads the newline-delimited event stream of a remote watch.
pub struct ProxyWatcher {
    stream: ByteStream,
    buf: BytesMut,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
}

impl ProxyWatcher {
    fn new(stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        let (exit_tx, exit_rx) = watch::channel(false);
        Self {
            stream: Box::pin(stream),
            buf: BytesMut::new(),
            exit_tx,
            exit_rx,
        }
    }

    fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        Some(line.freeze())
    }
}

#[async_trait]
impl Watcher for ProxyWatcher {
    async fn next(&mut self) -> Result<RegistryResult> {
        loop {
            let stopped = *self.exit_rx.borrow();
            if stopped {
                return Err(RegistryError::WatcherStopped);
            }

            if let Some(line) = self.next_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let event: Event = serde_json::from_slice(&line)?;
                return Ok(event.into());
            }

            tokio::select! {
                biased;
                _ = self.exit_rx.changed() => return Err(RegistryError::WatcherStopped),
                chunk = self.stream.next() => match chunk {
                    Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(RegistryError::WatcherStopped),
                },
            }
        }
    }

    fn stop(&self) {
        self.exit_tx.send_replace(true);
    }
}
