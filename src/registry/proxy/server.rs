use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{
    DeregisterRequest, HttpResponse, RegisterRequest, WatchQuery, DEREGISTER_PATH, REGISTER_PATH,
    SERVICES_PATH, WATCH_PATH,
};
use crate::registry::{
    Event, RegisterOptions, Registry, RegistryError, Result, Service, WatchOptions,
};

pub fn registry_router(registry: Arc<dyn Registry>) -> Router {
    Router::new()
        .route(REGISTER_PATH, post(register))
        .route(DEREGISTER_PATH, post(deregister))
        .route(SERVICES_PATH, get(list_services))
        .route(&format!("{}/:name", SERVICES_PATH), get(get_service))
        .route(WATCH_PATH, get(watch))
        .with_state(registry)
}

/// Serve the registry API on `addr` until `shutdown` resolves.
pub async fn start_server(
    registry: Arc<dyn Registry>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(registry, listener, shutdown).await
}

pub async fn serve(
    registry: Arc<dyn Registry>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Registry API listening on {}", listener.local_addr()?);
    axum::serve(listener, registry_router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(message: &str, e: RegistryError) -> Response {
    let status = match &e {
        RegistryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotFound => StatusCode::NOT_FOUND,
        _ => {
            error!("{}: {}", message, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let response = HttpResponse::new(status.as_u16() as i32, message.to_string(), e.to_string());
    (status, Json(response)).into_response()
}

async fn register(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let opts = RegisterOptions::with_ttl(Duration::from_millis(req.ttl_ms.unwrap_or_default()));
    if let Err(e) = registry.register(&req.service, opts).await {
        return error_response("Failed to register service", e);
    }

    debug!("Registered {} via API", req.service.name);
    let response = HttpResponse::new(0, "Service registered successfully".to_string(), ());
    (StatusCode::OK, Json(response)).into_response()
}

async fn deregister(
    State(registry): State<Arc<dyn Registry>>,
    Json(req): Json<DeregisterRequest>,
) -> Response {
    if let Err(e) = registry.deregister(&req.service).await {
        return error_response("Failed to deregister service", e);
    }

    debug!("Deregistered {} via API", req.service.name);
    let response = HttpResponse::new(0, "Service deregistered successfully".to_string(), ());
    (StatusCode::OK, Json(response)).into_response()
}

async fn list_services(State(registry): State<Arc<dyn Registry>>) -> Response {
    match registry.list_services().await {
        Ok(services) => {
            let response = HttpResponse::new(0, "success".to_string(), services);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => error_response("Failed to list services", e),
    }
}

async fn get_service(
    State(registry): State<Arc<dyn Registry>>,
    Path(name): Path<String>,
) -> Response {
    match registry.get_service(&name).await {
        Ok(services) => {
            let response: HttpResponse<Vec<Service>> =
                HttpResponse::new(0, "success".to_string(), services);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => error_response("Failed to get service", e),
    }
}

/// Stream registry events as newline-delimited JSON until the client goes
/// away. Dropping the body drops the watcher, which stops it.
async fn watch(
    State(registry): State<Arc<dyn Registry>>,
    Query(query): Query<WatchQuery>,
) -> Response {
    let opts = WatchOptions::service(query.service.unwrap_or_default());
    let watcher = match registry.watch(opts).await {
        Ok(watcher) => watcher,
        Err(e) => return error_response("Failed to watch registry", e),
    };

    let events = stream::unfold(watcher, |mut watcher| async move {
        match watcher.next().await {
            Ok(result) => match serde_json::to_vec(&Event::from(result)) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some((Ok::<_, std::io::Error>(Bytes::from(line)), watcher))
                }
                Err(e) => {
                    error!("Failed to encode watch event: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!("Watch stream closed: {}", e);
                None
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(events),
    )
        .into_response()
}
