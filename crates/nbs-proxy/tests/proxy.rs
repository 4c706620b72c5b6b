//! End-to-end tests of the proxy router against a mock app server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use nbs_common::ProxyConfig;
use nbs_proxy::{
    build_loader, build_orchestrator, expire_idle_clients, parse_origin, router, AppState,
};
use nbs_sw::{CacheStorage, Fetcher, ServiceWorkerContainer};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ORIGIN: &str = "http://localhost:8080";

fn config(upstream: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.origin = ORIGIN.to_string();
    config.upstream = upstream.to_string();
    config.cache.persistent = false;
    config.precache = vec!["/".to_string(), "/offline.html".to_string()];
    config
}

fn app_state(config: ProxyConfig, storage: CacheStorage) -> Arc<AppState> {
    let origin = parse_origin(&config.origin).unwrap();
    let loader = Arc::new(build_loader(&config, &origin).unwrap());
    let (container, _events) = ServiceWorkerContainer::new(origin.join("/").unwrap());
    Arc::new(AppState {
        config,
        origin,
        container: Arc::new(container),
        loader,
        storage,
    })
}

async fn mount_app(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("home"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/offline.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("you are offline"),
        )
        .mount(server)
        .await;
}

/// Proxy state with version `v1` installed and active.
async fn running_proxy(server: &MockServer) -> Arc<AppState> {
    mount_app(server).await;
    let state = app_state(config(&server.uri()), CacheStorage::in_memory());
    state.register_version("v1").await.unwrap();
    state
}

/// Upstream address with nothing listening.
fn closed_upstream() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn navigate(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("sec-fetch-mode", "navigate")
        .header("accept", "text/html")
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
    router(Arc::clone(state)).oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn cache_status(response: &Response) -> &str {
    response
        .headers()
        .get("x-sw-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[tokio::test]
async fn precached_page_is_served_from_cache() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;

    let response = send(&state, navigate("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(cache_status(&response), "hit");
    assert_eq!(body_text(response).await, "home");

    state.container.active().await.unwrap().settle().await;
}

#[tokio::test]
async fn unknown_page_gets_offline_document_when_upstream_fails() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;

    // Every request now answers 404.
    server.reset().await;

    let response = send(&state, navigate("/stats")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(cache_status(&response), "hit");
    assert_eq!(body_text(response).await, "you are offline");
}

#[tokio::test]
async fn mutating_request_is_forwarded() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/sessions"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(2)
        .mount(&server)
        .await;

    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"minutes":25}"#))
            .unwrap();
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(cache_status(&response), "miss");
        assert_eq!(body_text(response).await, "created");
    }

    let active = state.container.active().await.unwrap();
    assert_eq!(active.pages().keys().await.unwrap().len(), 2);
}

#[tokio::test]
async fn restart_with_upstream_down_serves_cached_copies() {
    let server = MockServer::start().await;
    let online = running_proxy(&server).await;
    let storage = online.storage.clone();

    let offline = app_state(config(&closed_upstream()), storage);
    let fetcher: Arc<dyn Fetcher> = offline.loader.clone();
    let orchestrator =
        build_orchestrator(&offline.config, &offline.origin, "v1", &offline.storage, fetcher)
            .unwrap();
    offline
        .container
        .restore_active(Arc::new(orchestrator))
        .await
        .unwrap();

    let response = send(&offline, navigate("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "home");

    let response = send(&offline, navigate("/history")).await;
    assert_eq!(body_text(response).await, "you are offline");

    // Uncached asset: network error.
    let response = send(&offline, get("/_next/static/app.js")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // Network-first data with no copy.
    let response = send(&offline, get("/api/summary")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Offline");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/sessions")
        .body(Body::empty())
        .unwrap();
    let response = send(&offline, request).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    offline.container.active().await.unwrap().settle().await;
}

#[tokio::test]
async fn status_reports_registration_and_partitions() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;

    let response = send(&state, get("/__sw/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;

    assert_eq!(status["registration"]["active"]["version"], "v1");
    assert_eq!(status["registration"]["active"]["state"], "activated");
    assert!(status["registration"]["waiting"].is_null());
    let partitions: Vec<&str> = status["partitions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(partitions.contains(&"nbs-pwa-pages-v1"));
}

#[tokio::test]
async fn update_activates_new_version_and_drops_old_partitions() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/__sw/update")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"version":"v2"}"#))
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["registration"]["active"]["version"], "v2");

    let partitions = state.storage.keys().await.unwrap();
    assert!(partitions.contains(&"nbs-pwa-pages-v2".to_string()));
    assert!(!partitions.iter().any(|name| name.ends_with("-v1")));
}

#[tokio::test]
async fn update_with_bad_version_is_rejected() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/__sw/update")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"version":"../v2"}"#))
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
    assert_eq!(state.container.active_version().await.as_deref(), Some("v1"));
}

#[tokio::test]
async fn skip_waiting_message_activates_waiting_version() {
    let server = MockServer::start().await;
    mount_app(&server).await;
    let mut config = config(&server.uri());
    config.skip_waiting_on_install = false;
    let state = app_state(config, CacheStorage::in_memory());
    state.register_version("v1").await.unwrap();

    // A page loaded under v1 holds the new version back.
    let mut request = navigate("/");
    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    assert_eq!(send(&state, request).await.status(), StatusCode::OK);

    state.register_version("v2").await.unwrap();
    let status = state.container.status().await;
    assert_eq!(status.active.unwrap().version, "v1");
    assert_eq!(status.waiting.unwrap().version, "v2");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/__sw/message")
        .body(Body::from("SKIP_WAITING"))
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["activated"], true);
    assert_eq!(body["active_version"], "v2");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/__sw/message")
        .body(Body::from(r#"{"type":"PING"}"#))
        .unwrap();
    let body = body_json(send(&state, request).await).await;
    assert_eq!(body["activated"], false);
}

#[tokio::test]
async fn cross_origin_target_is_refused() {
    let server = MockServer::start().await;
    let state = running_proxy(&server).await;
    Mock::given(method("GET"))
        .and(path("/font.woff2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("font"))
        .expect(0)
        .mount(&server)
        .await;

    let target = format!("{}/font.woff2", server.uri());
    let response = send(&state, get(&target)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_json(response).await["error"].is_string());

    // Absolute form naming the public origin is served as usual.
    let response = send(&state, navigate(&format!("{}/", ORIGIN))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "home");
}

#[tokio::test]
async fn idle_client_stops_holding_waiting_version() {
    let server = MockServer::start().await;
    mount_app(&server).await;
    let mut config = config(&server.uri());
    config.skip_waiting_on_install = false;
    let state = app_state(config, CacheStorage::in_memory());
    state.register_version("v1").await.unwrap();

    let mut request = navigate("/");
    let peer: SocketAddr = "127.0.0.1:50001".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    assert_eq!(send(&state, request).await.status(), StatusCode::OK);

    state.register_version("v2").await.unwrap();
    assert_eq!(state.container.active_version().await.as_deref(), Some("v1"));

    let sweeper = tokio::spawn(expire_idle_clients(
        Arc::clone(&state.container),
        Duration::from_millis(20),
    ));
    let mut active = None;
    for _ in 0..200 {
        active = state.container.active_version().await;
        if active.as_deref() == Some("v2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sweeper.abort();

    assert_eq!(active.as_deref(), Some("v2"));
    assert_eq!(state.container.status().await.clients, 0);
}
