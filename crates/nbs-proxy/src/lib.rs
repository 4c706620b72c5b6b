//! # NBS Proxy
//!
//! Runs the offline cache orchestrator as a local HTTP proxy placed in
//! front of the app server. Every browser request goes through
//! [`nbs_sw::ServiceWorkerContainer::handle_fetch`]; requests the active
//! version does not intercept are forwarded upstream unchanged.
//! Absolute-form requests for another origin are refused unless
//! `allow_cross_origin` is set.
//!
//! Control endpoints live under a configurable prefix (default `/__sw`):
//!
//! - `POST {prefix}/message`: post a control message (`SKIP_WAITING`)
//! - `GET {prefix}/status`: registration slots and stored partitions
//! - `POST {prefix}/update`: register a new version, `{"version": "v3"}`

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nbs_common::{NbsError, ProxyConfig};
use nbs_net::{LoaderConfig, NetError, ResourceLoader};
use nbs_sw::{
    CacheNames, CacheOrchestrator, CacheStorage, DiskBackend, Fetcher, OrchestratorConfig,
    ServiceWorkerContainer, ServiceWorkerError,
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub mod convert;
pub mod server;
pub mod state;

pub use server::{router, start_server, AppState};
pub use state::{record_activations, RegistrationRecord, RegistrationStore};

/// Errors surfaced by the proxy host.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cross-origin target refused: {0}")]
    CrossOrigin(String),

    #[error(transparent)]
    Config(#[from] NbsError),

    #[error(transparent)]
    Worker(#[from] ServiceWorkerError),

    #[error(transparent)]
    Network(#[from] NetError),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::CrossOrigin(_) => StatusCode::FORBIDDEN,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Worker(e) => match e {
                ServiceWorkerError::RegistrationFailed(_) | ServiceWorkerError::StateError(_) => {
                    StatusCode::CONFLICT
                }
                ServiceWorkerError::InvalidName(_) | ServiceWorkerError::SecurityError(_) => {
                    StatusCode::BAD_REQUEST
                }
                ServiceWorkerError::InstallFailed(_) | ServiceWorkerError::NetworkError(_) => {
                    StatusCode::BAD_GATEWAY
                }
                ServiceWorkerError::CacheError(_) | ServiceWorkerError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Parse the public origin and check it is usable as a cache scope.
pub fn parse_origin(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw)
        .map_err(|e| NbsError::config(format!("origin '{}' is not a URL: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NbsError::config(format!("origin '{}' must be http or https", raw)).into());
    }
    Ok(url)
}

/// Build the upstream loader from the configuration.
pub fn build_loader(config: &ProxyConfig, origin: &Url) -> Result<ResourceLoader, ProxyError> {
    let upstream = Url::parse(&config.upstream).map_err(|e| {
        NbsError::config(format!("upstream '{}' is not a URL: {}", config.upstream, e))
    })?;
    let mut loader_config = LoaderConfig::new(origin.clone()).upstream(upstream);
    if let Some(secs) = config.upstream_timeout_secs {
        loader_config = loader_config.timeout(Duration::from_secs(secs));
    }
    Ok(ResourceLoader::new(loader_config)?)
}

/// Open cache storage: on disk under `cache.dir`, or in memory.
pub async fn build_storage(config: &ProxyConfig) -> Result<CacheStorage, ProxyError> {
    if config.cache.persistent {
        let backend = DiskBackend::open(config.cache.dir.join("caches")).await?;
        Ok(CacheStorage::new(Arc::new(backend)))
    } else {
        Ok(CacheStorage::in_memory())
    }
}

/// Build the orchestrator for one version using the configured policies.
pub fn build_orchestrator(
    config: &ProxyConfig,
    origin: &Url,
    version: &str,
    storage: &CacheStorage,
    fetcher: Arc<dyn Fetcher>,
) -> Result<CacheOrchestrator, ProxyError> {
    let names = CacheNames::new(config.cache.prefix.clone(), version)?;
    let worker_config = OrchestratorConfig::new(origin.clone(), names)?
        .with_precache(&config.precache)?
        .with_offline_fallback(Some(&config.offline_fallback))?
        .with_asset_prefixes(config.asset_prefixes.iter().cloned())
        .with_skip_waiting_on_install(config.skip_waiting_on_install);
    Ok(CacheOrchestrator::new(
        worker_config,
        storage.clone(),
        fetcher,
    ))
}

/// Periodically forget clients idle for `max_idle`.
///
/// Browsers never tell the proxy a tab closed, so without this a waiting
/// version would stay held back by every peer ever seen.
pub async fn expire_idle_clients(container: Arc<ServiceWorkerContainer>, max_idle: Duration) {
    let period = (max_idle / 2).clamp(Duration::from_millis(10), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = container.expire_idle_clients(max_idle).await {
            warn!(error = %e, "Activation after client expiry failed");
        }
    }
}
