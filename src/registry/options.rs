use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::types::Service;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_NAMESPACE: &str = "micro";
/// Lease TTL used by the etcd backend when a registration carries none.
pub const DEFAULT_REGISTER_TTL: Duration = Duration::from_secs(15);

/// PEM files used to secure the connection to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub addrs: Vec<String>,
    /// Deadline applied to every backend call.
    pub timeout: Duration,
    pub secure: bool,
    pub tls: Option<TlsConfig>,
    pub namespace: String,
    pub credentials: Option<Credentials>,
    /// Services preloaded into the in-memory backend. They never expire.
    pub services: HashMap<String, Vec<Service>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            secure: false,
            tls: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            credentials: None,
            services: HashMap::new(),
        }
    }
}

impl Options {
    pub fn with_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.secure = true;
        self.tls = Some(tls);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_services(mut self, services: HashMap<String, Vec<Service>>) -> Self {
        self.services = services;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Liveness window of the registered nodes. Zero falls back to the
    /// service's own TTL.
    pub ttl: Duration,
}

impl RegisterOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// TTL from the options, else from the service, else zero.
    pub fn resolve_ttl(&self, service: &Service) -> Duration {
        if !self.ttl.is_zero() {
            return self.ttl;
        }
        service.ttl.map(Duration::from_secs).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only deliver changes of this service. Empty watches everything.
    pub service: String,
}

impl WatchOptions {
    pub fn service(name: impl Into<String>) -> Self {
        Self { service: name.into() }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.service.is_empty() || self.service == name
    }
}
