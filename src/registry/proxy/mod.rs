//! Registry exposed over HTTP.
//!
//! The server side wraps any [`Registry`](crate::registry::Registry) in an axum
//! router; the client side implements the same trait against that router, so
//! processes without direct backend access can still register and watch.

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

#[cfg(all(test, feature = "server", feature = "client"))]
mod tests;

use serde::{Deserialize, Serialize};

use super::Service;

pub const REGISTER_PATH: &str = "/registry/register";
pub const DEREGISTER_PATH: &str = "/registry/deregister";
pub const SERVICES_PATH: &str = "/registry/services";
pub const WATCH_PATH: &str = "/registry/watch";

/// Envelope of every non-streaming response. `code` is 0 on success and the
/// HTTP status otherwise, in which case `data` holds the error text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse<T> {
    pub code: i32,
    pub message: String,
    pub data: T,
}

impl<T> HttpResponse<T> {
    pub fn new(code: i32, message: String, data: T) -> Self {
        Self { code, message, data }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub service: Service,
    /// Milliseconds. Absent or zero defers to the service TTL.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub service: Service,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub service: Option<String>,
}
