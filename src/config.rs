use dotenv::dotenv;
use once_cell::sync::Lazy;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::options::{DEFAULT_NAMESPACE, DEFAULT_REGISTER_TTL, DEFAULT_TIMEOUT};
use crate::registry::{Options, RegistryError, RegistryKind, Result, TlsConfig};

pub static REGISTRY_BACKEND: Lazy<String> =
    Lazy::new(|| env::var("REGISTRY_BACKEND").unwrap_or_else(|_| "memory".to_string()));
pub static REGISTRY_HTTP_ADDR: Lazy<String> =
    Lazy::new(|| env::var("REGISTRY_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:7200".to_string()));
pub static REGISTRY_LOG_DIR: Lazy<String> =
    Lazy::new(|| env::var("REGISTRY_LOG_DIR").unwrap_or_else(|_| "./logs".to_string()));
pub static REGISTRY_TTL: Lazy<String> =
    Lazy::new(|| env::var("REGISTRY_TTL").unwrap_or_else(|_| DEFAULT_REGISTER_TTL.as_secs().to_string()));

pub fn init_env() {
    dotenv().ok();
}

pub fn backend_kind() -> Result<RegistryKind> {
    REGISTRY_BACKEND.parse()
}

pub fn http_addr() -> Result<SocketAddr> {
    REGISTRY_HTTP_ADDR
        .parse()
        .map_err(|e| RegistryError::Config(format!("invalid REGISTRY_HTTP_ADDR: {}", e)))
}

pub fn register_ttl() -> Result<Duration> {
    parse_secs("REGISTRY_TTL", &REGISTRY_TTL)
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| RegistryError::Config(format!("invalid {}: {}", key, e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Registry options from the process environment.
pub fn options_from_env() -> Result<Options> {
    options_from_lookup(|key| env::var(key).ok())
}

/// Registry options from any key lookup, e.g. a map in tests.
pub fn options_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Options> {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let mut options = Options::default()
        .with_timeout(DEFAULT_TIMEOUT)
        .with_namespace(get("REGISTRY_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()));

    if let Some(addrs) = get("REGISTRY_ADDRESS") {
        options = options.with_addrs(
            addrs
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty()),
        );
    }
    if let Some(timeout) = get("REGISTRY_TIMEOUT") {
        options = options.with_timeout(parse_secs("REGISTRY_TIMEOUT", &timeout)?);
    }
    if let Some(secure) = get("REGISTRY_SECURE") {
        options = options.with_secure(parse_bool(&secure));
    }

    let tls = TlsConfig {
        ca_cert: get("REGISTRY_TLS_CA").map(PathBuf::from),
        client_cert: get("REGISTRY_TLS_CERT").map(PathBuf::from),
        client_key: get("REGISTRY_TLS_KEY").map(PathBuf::from),
        domain: get("REGISTRY_TLS_DOMAIN"),
    };
    if tls != TlsConfig::default() {
        options = options.with_tls(tls);
    }

    match (get("REGISTRY_USERNAME"), get("REGISTRY_PASSWORD")) {
        (Some(username), password) => {
            options = options.with_credentials(username, password.unwrap_or_default());
        }
        (None, Some(_)) => {
            return Err(RegistryError::Config(
                "REGISTRY_PASSWORD is set without REGISTRY_USERNAME".to_string(),
            ))
        }
        (None, None) => {}
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let options = options_from_lookup(lookup(&[])).unwrap();
        assert!(options.addrs.is_empty());
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.namespace, "micro");
        assert!(!options.secure);
        assert!(options.tls.is_none());
        assert!(options.credentials.is_none());
    }

    #[test]
    fn test_full_environment() {
        let options = options_from_lookup(lookup(&[
            ("REGISTRY_ADDRESS", "http://etcd-1:2379, http://etcd-2:2379,"),
            ("REGISTRY_TIMEOUT", "3"),
            ("REGISTRY_NAMESPACE", "staging"),
            ("REGISTRY_TLS_CA", "/etc/etcd/ca.pem"),
            ("REGISTRY_USERNAME", "root"),
            ("REGISTRY_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(options.addrs, vec!["http://etcd-1:2379", "http://etcd-2:2379"]);
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert_eq!(options.namespace, "staging");
        assert!(options.secure);
        assert_eq!(
            options.tls.unwrap().ca_cert,
            Some(PathBuf::from("/etc/etcd/ca.pem"))
        );
        let credentials = options.credentials.unwrap();
        assert_eq!(credentials.username, "root");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            options_from_lookup(lookup(&[("REGISTRY_TIMEOUT", "soon")])),
            Err(RegistryError::Config(_))
        ));
        assert!(matches!(
            options_from_lookup(lookup(&[("REGISTRY_PASSWORD", "secret")])),
            Err(RegistryError::Config(_))
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("off"));
        assert_eq!(parse_secs("X", " 15 ").unwrap(), Duration::from_secs(15));
    }
}
