//! The cache orchestrator: one worker version's install, activate and fetch
//! handlers.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use nbs_net::Request;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage, RequestKey};
use crate::fetch::{FetchResponse, Fetcher};
use crate::manifest::{PrecacheManifest, DEFAULT_OFFLINE_FALLBACK};
use crate::message::ControlMessage;
use crate::naming::CacheNames;
use crate::route::{Route, Router};
use crate::strategy::{Revalidations, Strategies, WriteGate};
use crate::{Result, ServiceWorkerError};

/// Default same-origin path prefixes served cache-first.
pub const DEFAULT_ASSET_PREFIXES: [&str; 2] = ["/_next/", "/icons/"];

/// Static configuration of one worker version.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// App origin.
    pub origin: Url,

    /// Partition names for this version.
    pub names: CacheNames,

    /// App shell precached at install.
    pub precache: PrecacheManifest,

    /// Document served to failed navigations, looked up in the pages partition.
    pub offline_fallback: Option<Url>,

    /// Same-origin prefixes served cache-first.
    pub asset_prefixes: Vec<String>,

    /// Request activation as soon as install succeeds.
    pub skip_waiting_on_install: bool,
}

impl OrchestratorConfig {
    /// Configuration with the built-in manifest, fallback and asset prefixes.
    pub fn new(origin: Url, names: CacheNames) -> Result<Self> {
        let precache = PrecacheManifest::default_for(&origin)?;
        let offline_fallback = Some(resolve(&origin, DEFAULT_OFFLINE_FALLBACK)?);
        Ok(Self {
            origin,
            names,
            precache,
            offline_fallback,
            asset_prefixes: DEFAULT_ASSET_PREFIXES.iter().map(|p| p.to_string()).collect(),
            skip_waiting_on_install: true,
        })
    }

    /// Replace the precache manifest.
    pub fn with_precache<I, S>(mut self, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.precache = PrecacheManifest::new(&self.origin, entries)?;
        Ok(self)
    }

    /// Replace the offline fallback path; `None` disables it.
    pub fn with_offline_fallback(mut self, path: Option<&str>) -> Result<Self> {
        self.offline_fallback = path.map(|p| resolve(&self.origin, p)).transpose()?;
        Ok(self)
    }

    pub fn with_asset_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }
}

fn resolve(origin: &Url, path: &str) -> Result<Url> {
    origin
        .join(path)
        .map_err(|e| ServiceWorkerError::InvalidName(format!("bad path '{}': {}", path, e)))
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub version: String,
    /// Entries written to the pages partition.
    pub precached: usize,
    /// The version asks to skip the waiting phase.
    pub skip_waiting: bool,
}

/// Result of activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateOutcome {
    /// Stale partitions that were deleted.
    pub deleted: Vec<String>,
}

/// What the host should do with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; send the request on unchanged.
    Passthrough(Request),
    /// Respond with this.
    Respond(FetchResponse),
}

impl FetchOutcome {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough(_))
    }

    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough(_) => None,
        }
    }

    pub fn into_response(self) -> Option<FetchResponse> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough(_) => None,
        }
    }
}

/// One worker version's handlers over explicit partition references.
pub struct CacheOrchestrator {
    config: OrchestratorConfig,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    router: Router,
    pages: Cache,
    assets: Cache,
    offline_key: Option<RequestKey>,
    revalidations: Revalidations,
    gate: Arc<WriteGate>,
}

impl fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("version", &self.config.names.version())
            .field("pages", &self.pages.name())
            .field("assets", &self.assets.name())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl CacheOrchestrator {
    pub fn new(config: OrchestratorConfig, storage: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        let router = Router::standard(&config.origin, config.asset_prefixes.iter().cloned());
        let pages = storage.cache(&config.names.pages());
        let assets = storage.cache(&config.names.assets());
        let offline_key = config.offline_fallback.as_ref().map(RequestKey::get);

        Self {
            config,
            storage,
            fetcher,
            router,
            pages,
            assets,
            offline_key,
            revalidations: Revalidations::default(),
            gate: Arc::new(WriteGate::default()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn names(&self) -> &CacheNames {
        &self.config.names
    }

    pub fn version(&self) -> &str {
        self.config.names.version()
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn pages(&self) -> &Cache {
        &self.pages
    }

    pub fn assets(&self) -> &Cache {
        &self.assets
    }

    /// Precache the manifest into this version's pages partition.
    ///
    /// All manifest URLs are fetched before anything is written; a single
    /// failed or non-200 fetch fails the install. A pages partition created
    /// by a failed install is removed again.
    pub async fn on_install(&self) -> Result<InstallOutcome> {
        let pages_name = self.config.names.pages();
        let existed = self.storage.has(&pages_name).await?;
        let pages = self.storage.open(&pages_name).await?;

        match self.precache(&pages).await {
            Ok(precached) => {
                info!(version = %self.version(), precached, cache = %pages_name, "Install complete");
                Ok(InstallOutcome {
                    version: self.version().to_string(),
                    precached,
                    skip_waiting: self.config.skip_waiting_on_install,
                })
            }
            Err(e) => {
                warn!(version = %self.version(), error = %e, "Install failed");
                if !existed {
                    if let Err(cleanup) = self.storage.delete(&pages_name).await {
                        warn!(cache = %pages_name, error = %cleanup, "Could not remove partial install");
                    }
                }
                Err(e)
            }
        }
    }

    async fn precache(&self, pages: &Cache) -> Result<usize> {
        let fetches = self.config.precache.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let result = self.fetcher.fetch(&request).await;
            (url, result)
        });

        let mut responses = Vec::with_capacity(self.config.precache.len());
        for (url, result) in join_all(fetches).await {
            let response = result.map_err(|e| {
                ServiceWorkerError::InstallFailed(format!("fetching {}: {}", url, e))
            })?;
            if response.status != 200 {
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "fetching {}: status {}",
                    url, response.status
                )));
            }
            responses.push((RequestKey::get(url), response));
        }

        for (key, response) in &responses {
            pages.put(key, response).await?;
            trace!(key = %key, "Precached");
        }
        Ok(responses.len())
    }

    /// Delete every stale partition of this app.
    ///
    /// Returns once all deletions finished; claiming clients is up to the
    /// caller and must come after.
    pub async fn on_activate(&self) -> Result<ActivateOutcome> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| self.config.names.is_stale(name))
            .collect();

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::with_capacity(stale.len());
        let mut first_error = None;
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    debug!(cache = %name, "Deleted stale partition");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Could not delete stale partition");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!(version = %self.version(), deleted = deleted.len(), "Activation sweep complete");
        Ok(ActivateOutcome { deleted })
    }

    /// Routing decision for a request, without running anything.
    pub fn route(&self, request: &Request) -> Route {
        self.router.route(request)
    }

    /// Intercept one request.
    pub async fn on_fetch(&self, request: Request) -> FetchOutcome {
        let route = self.route(&request);
        trace!(url = %request.url, method = %request.method, ?route, "Routed");

        let strategies = Strategies {
            pages: &self.pages,
            assets: &self.assets,
            fetcher: &self.fetcher,
            offline_fallback: self.offline_key.as_ref(),
            revalidations: &self.revalidations,
            gate: &self.gate,
        };

        let response = match route {
            Route::Passthrough(_) => return FetchOutcome::Passthrough(request),
            Route::Page => strategies.page(&request).await,
            Route::Asset => strategies.asset(&request).await,
            Route::NetworkFirst => strategies.network_first(&request).await,
        };

        debug!(
            url = %request.url,
            ?route,
            status = response.status,
            source = ?response.source,
            "Fetch handled"
        );
        FetchOutcome::Respond(response)
    }

    /// Interpret a posted message.
    pub fn on_message(&self, data: &str) -> Option<ControlMessage> {
        ControlMessage::parse(data)
    }

    /// Background revalidations still running.
    pub fn revalidations_in_flight(&self) -> usize {
        self.revalidations.in_flight()
    }

    /// Wait for every background revalidation spawned so far.
    pub async fn settle(&self) {
        self.revalidations.settle().await;
    }

    /// Stop caching for this version and cancel its revalidations.
    ///
    /// Returns once no write of this version is still in flight.
    pub async fn retire(&self) {
        self.revalidations.abort_all();
        self.gate.close().await;
        debug!(version = %self.version(), "Version retired");
    }

    pub fn is_retired(&self) -> bool {
        self.gate.is_closed()
    }

    /// Cancel background work without retiring.
    pub fn shutdown(&self) {
        self.revalidations.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use nbs_net::{NetError, Response, ResponseType};
    use std::sync::Mutex;

    const ORIGIN: &str = "http://localhost:8080";

    /// Serves `200 "{path}"` for every path, except those marked failing.
    #[derive(Default)]
    struct EchoFetcher {
        failing: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            let path = request.url.path().to_string();
            self.calls.lock().unwrap().push(path.clone());
            if self.failing.lock().unwrap().contains(&path) {
                return Err(NetError::ConnectionFailed("refused".to_string()));
            }
            Ok(Response {
                url: request.url.clone(),
                status: 200,
                status_text: "OK".to_string(),
                headers: HeaderMap::new(),
                body: Bytes::from(path),
                response_type: ResponseType::Basic,
            })
        }
    }

    fn orchestrator(version: &str, storage: &CacheStorage) -> (CacheOrchestrator, Arc<EchoFetcher>) {
        let fetcher = Arc::new(EchoFetcher::default());
        let config = OrchestratorConfig::new(
            Url::parse(ORIGIN).unwrap(),
            CacheNames::new("nbs-pwa", version).unwrap(),
        )
        .unwrap();
        let orchestrator = CacheOrchestrator::new(config, storage.clone(), fetcher.clone());
        (orchestrator, fetcher)
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::new(
            Url::parse(ORIGIN).unwrap(),
            CacheNames::new("nbs-pwa", "v2").unwrap(),
        )
        .unwrap();
        assert_eq!(config.precache.len(), 5);
        assert_eq!(config.offline_fallback, Some(url("/offline.html")));
        assert_eq!(config.asset_prefixes, vec!["/_next/", "/icons/"]);
        assert!(config.skip_waiting_on_install);

        let config = config.with_offline_fallback(None).unwrap();
        assert!(config.offline_fallback.is_none());
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let storage = CacheStorage::in_memory();
        let (sw, fetcher) = orchestrator("v2", &storage);

        let outcome = sw.on_install().await.unwrap();
        assert_eq!(outcome.precached, 5);
        assert!(outcome.skip_waiting);
        assert_eq!(fetcher.calls.lock().unwrap().len(), 5);
        assert_eq!(sw.pages().keys().await.unwrap().len(), 5);
        assert!(!storage.has("nbs-pwa-assets-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_install_leaves_nothing() {
        let storage = CacheStorage::in_memory();
        let (sw, fetcher) = orchestrator("v2", &storage);
        fetcher
            .failing
            .lock()
            .unwrap()
            .push("/manifest.webmanifest".to_string());

        let result = sw.on_install().await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_deletes_only_stale_partitions() {
        let storage = CacheStorage::in_memory();
        for name in [
            "nbs-pwa-pages-v1",
            "nbs-pwa-assets-v1",
            "nbs-pwa-pages-v2",
            "other-app-pages-v1",
        ] {
            storage.open(name).await.unwrap();
        }
        let (sw, _) = orchestrator("v2", &storage);

        let outcome = sw.on_activate().await.unwrap();
        assert_eq!(outcome.deleted, vec!["nbs-pwa-assets-v1", "nbs-pwa-pages-v1"]);
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["nbs-pwa-pages-v2", "other-app-pages-v1"]
        );
    }

    #[tokio::test]
    async fn test_post_is_handed_back() {
        let storage = CacheStorage::in_memory();
        let (sw, fetcher) = orchestrator("v2", &storage);

        let outcome = sw
            .on_fetch(Request::new(Method::POST, url("/sessions")))
            .await;
        match outcome {
            FetchOutcome::Passthrough(request) => assert_eq!(request.method, Method::POST),
            other => panic!("expected passthrough, got {:?}", other),
        }
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retired_version_stops_caching() {
        let storage = CacheStorage::in_memory();
        let (sw, _) = orchestrator("v1", &storage);
        sw.retire().await;
        assert!(sw.is_retired());

        let outcome = sw.on_fetch(Request::get(url("/data.json"))).await;
        assert_eq!(outcome.response().unwrap().status, 200);
        assert!(!storage.has("nbs-pwa-assets-v1").await.unwrap());
    }

    #[test]
    fn test_on_message() {
        let storage = CacheStorage::in_memory();
        let (sw, _) = orchestrator("v2", &storage);
        assert_eq!(sw.on_message("SKIP_WAITING"), Some(ControlMessage::SkipWaiting));
        assert_eq!(sw.on_message("hello"), None);
    }
}
