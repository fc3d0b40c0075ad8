use super::client::ProxyRegistry;
use super::server::{registry_router, serve};
use super::*;
use crate::registry::memory::{MemoryRegistry, TTL_PRUNE_INTERVAL};
use crate::registry::{
    Action, Node, Options, RegisterOptions, Registry, RegistryError, WatchOptions,
};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tower::ServiceExt;

fn create_test_service_info(name: &str, node_id: &str) -> Service {
    Service::new(name, "0.1.0").with_node(Node::new(node_id, "127.0.0.1:8080"))
}

fn setup_backend() -> Arc<dyn Registry> {
    Arc::new(MemoryRegistry::new(Options::default()))
}

async fn read_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: &impl Serialize) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Serve `backend` on a loopback port and return a client pointed at it.
async fn start_proxy(backend: Arc<dyn Registry>) -> (ProxyRegistry, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve(backend, listener, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    let options = Options::default()
        .with_addrs([addr.to_string()])
        .with_timeout(Duration::from_secs(2));
    (ProxyRegistry::new(options).unwrap(), shutdown_tx)
}

#[tokio::test]
async fn test_register_and_list_via_router() {
    let backend = setup_backend();
    let app = registry_router(backend.clone());

    let req = RegisterRequest {
        service: create_test_service_info("foo", "foo-1"),
        ttl_ms: Some(30_000),
    };
    let resp = app
        .clone()
        .oneshot(json_request("POST", REGISTER_PATH, &req))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_json(resp).await["code"], 0);

    let resp = app
        .oneshot(Request::builder().uri(SERVICES_PATH).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = read_json(resp).await;
    assert_eq!(body["data"][0]["name"], "foo");
    assert_eq!(body["data"][0]["nodes"][0]["id"], "foo-1");
}

#[tokio::test]
async fn test_subsecond_ttl_reaches_backend() {
    let backend = setup_backend();
    let (registry, shutdown) = start_proxy(backend.clone()).await;
    let service = create_test_service_info("short-lived", "short-1");

    let ttl = Duration::from_millis(300);
    registry
        .register(&service, RegisterOptions::with_ttl(ttl))
        .await
        .unwrap();
    assert!(backend.get_service("short-lived").await.is_ok());

    sleep(ttl + TTL_PRUNE_INTERVAL * 3).await;
    assert!(matches!(
        backend.get_service("short-lived").await,
        Err(RegistryError::NotFound)
    ));

    let _ = shutdown.send(());
}

#[test]
fn test_register_request_carries_milliseconds() {
    let req = RegisterRequest {
        service: create_test_service_info("foo", "foo-1"),
        ttl_ms: Some(1_900),
    };
    let body = serde_json::to_value(&req).unwrap();
    assert_eq!(body["ttl_ms"], 1_900);
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let app = registry_router(setup_backend());
    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("{}/missing", SERVICES_PATH))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(resp).await["code"], 404);
}

#[tokio::test]
async fn test_register_without_nodes_is_400() {
    let app = registry_router(setup_backend());
    let req = RegisterRequest {
        service: Service::new("foo", "0.1.0"),
        ttl_ms: None,
    };
    let resp = app
        .oneshot(json_request("POST", REGISTER_PATH, &req))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_client_round_trip() {
    let backend = setup_backend();
    let (registry, shutdown) = start_proxy(backend.clone()).await;
    let service = create_test_service_info("go.micro/foo", "foo-1");

    registry.register(&service, RegisterOptions::default()).await.unwrap();
    assert_eq!(backend.get_service("go.micro/foo").await.unwrap()[0].nodes, service.nodes);

    let services = registry.get_service("go.micro/foo").await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].nodes, service.nodes);
    assert_eq!(registry.list_services().await.unwrap().len(), 1);

    registry.deregister(&service).await.unwrap();
    assert!(matches!(
        registry.get_service("go.micro/foo").await,
        Err(RegistryError::NotFound)
    ));
    assert!(matches!(
        registry.register(&Service::new("foo", "1"), RegisterOptions::default()).await,
        Err(RegistryError::InvalidArgument(_))
    ));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_client_watch_stream() {
    let backend = setup_backend();
    let (registry, shutdown) = start_proxy(backend.clone()).await;

    let mut watcher = registry.watch(WatchOptions::service("foo")).await.unwrap();
    // the server subscribes before the response head is sent
    let other = create_test_service_info("bar", "bar-1");
    let service = create_test_service_info("foo", "foo-1");
    backend.register(&other, RegisterOptions::default()).await.unwrap();
    backend.register(&service, RegisterOptions::default()).await.unwrap();
    backend.deregister(&service).await.unwrap();

    let created = timeout(Duration::from_secs(2), watcher.next()).await.unwrap().unwrap();
    assert_eq!(created.action, Action::Create);
    assert_eq!(created.service.name, "foo");
    let deleted = timeout(Duration::from_secs(2), watcher.next()).await.unwrap().unwrap();
    assert_eq!(deleted.action, Action::Delete);
    assert_eq!(deleted.service.nodes[0].id, "foo-1");

    watcher.stop();
    watcher.stop();
    assert!(matches!(watcher.next().await, Err(RegistryError::WatcherStopped)));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unreachable_proxy_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let options = Options::default()
        .with_addrs([format!("http://{}", addr)])
        .with_timeout(Duration::from_millis(500));
    let registry = ProxyRegistry::new(options).unwrap();

    let err = registry.list_services().await.unwrap_err();
    assert!(err.is_transport());
}
