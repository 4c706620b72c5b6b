//! HTTP server implementation using Axum.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nbs_common::ProxyConfig;
use nbs_net::ResourceLoader;
use nbs_sw::{CacheStorage, FetchEvent, FetchOutcome, FetchResponse, Fetcher, ServiceWorkerContainer};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::{build_orchestrator, convert, ProxyError};

/// Largest request body forwarded upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Application state shared across handlers.
pub struct AppState {
    /// Proxy configuration.
    pub config: ProxyConfig,
    /// Public origin and cache scope.
    pub origin: Url,
    /// Registration and active version.
    pub container: Arc<ServiceWorkerContainer>,
    /// Upstream loader, also used for passthrough.
    pub loader: Arc<ResourceLoader>,
    /// Partition storage shared by every version.
    pub storage: CacheStorage,
}

impl AppState {
    /// Build and register a version with this proxy's policies.
    pub async fn register_version(&self, version: &str) -> Result<(), ProxyError> {
        let fetcher: Arc<dyn Fetcher> = self.loader.clone();
        let orchestrator =
            build_orchestrator(&self.config, &self.origin, version, &self.storage, fetcher)?;
        self.container.register(Arc::new(orchestrator)).await?;
        Ok(())
    }
}

/// Build the router: control endpoints plus the intercepting fallback.
pub fn router(state: Arc<AppState>) -> Router {
    let control = state.config.control_path.clone();

    Router::new()
        .route(&format!("{}/message", control), post(handle_message))
        .route(&format!("{}/status", control), get(handle_status))
        .route(&format!("{}/update", control), post(handle_update))
        .fallback(handle_fetch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the proxy server.
///
/// Returns the actual address the server is bound to (useful when port=0)
/// and the task serving it, which finishes after `shutdown` resolves.
pub async fn start_server<F>(
    state: Arc<AppState>,
    listen: &str,
    shutdown: F,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Proxy listening on {}", actual_addr);

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "Server error");
        }
    });

    Ok((actual_addr, handle))
}

/// Fetch interception for every non-control request.
async fn handle_fetch(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::InvalidRequest(format!("unreadable body: {}", e)).into_response()
        }
    };

    let request = match convert::to_request(
        &parts.method,
        &parts.uri,
        &parts.headers,
        body,
        &state.origin,
        state.config.allow_cross_origin,
    ) {
        Ok(request) => request,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Refused request");
            return e.into_response();
        }
    };

    let mut event = FetchEvent::new(request);
    if let Some(ConnectInfo(addr)) = peer {
        event = event.client(addr.ip().to_string());
    }

    match state.container.handle_fetch(event).await {
        FetchOutcome::Respond(response) => convert::into_response(response),
        FetchOutcome::Passthrough(request) => match state.loader.fetch(&request).await {
            Ok(response) => convert::into_response(FetchResponse::from_network(response)),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Passthrough failed");
                convert::into_response(FetchResponse::network_error())
            }
        },
    }
}

/// Control message from a page (`SKIP_WAITING`).
async fn handle_message(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let data = String::from_utf8_lossy(&body);
    match state.container.post_message(&data).await {
        Ok(activated) => Json(json!({
            "activated": activated,
            "active_version": state.container.active_version().await,
        }))
        .into_response(),
        Err(e) => ProxyError::from(e).into_response(),
    }
}

/// Registration slots and stored partitions.
async fn handle_status(State(state): State<Arc<AppState>>) -> Response {
    let registration = state.container.status().await;
    let partitions = match state.storage.keys().await {
        Ok(names) => names,
        Err(e) => return ProxyError::from(e).into_response(),
    };
    let revalidations = match state.container.active().await {
        Some(active) => active.revalidations_in_flight(),
        None => 0,
    };

    Json(json!({
        "registration": registration,
        "partitions": partitions,
        "revalidations": revalidations,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    version: String,
}

/// Register a new version at runtime.
async fn handle_update(
    State(state): State<Arc<AppState>>,
    Json(update): Json<UpdateRequest>,
) -> Response {
    info!(version = %update.version, "Update requested");
    match state.register_version(&update.version).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "registration": state.container.status().await })),
        )
            .into_response(),
        Err(e) => {
            warn!(version = %update.version, error = %e, "Update failed");
            e.into_response()
        }
    }
}
