//! Caching strategies run for routed requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nbs_net::{Request, Response, ResponseType};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cache::{Cache, CacheEntry, RequestKey};
use crate::fetch::{FetchResponse, Fetcher};

/// Background page revalidations owned by one worker version.
#[derive(Debug, Default)]
pub(crate) struct Revalidations {
    tasks: Mutex<JoinSet<()>>,
}

impl Revalidations {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Number of revalidations not yet reaped.
    pub(crate) fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait for every revalidation spawned so far.
    pub(crate) async fn settle(&self) {
        let mut pending = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        while pending.join_next().await.is_some() {}
    }

    /// Cancel every revalidation still running.
    pub(crate) fn abort_all(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.abort_all();
        while tasks.try_join_next().is_some() {}
    }
}

/// Cache writes of one worker version.
///
/// A write holds the gate shared across its retired check and its put, so
/// once [`WriteGate::close`] returns no write of this version is in flight
/// or can start.
#[derive(Debug, Default)]
pub(crate) struct WriteGate {
    closed: AtomicBool,
    writes: RwLock<()>,
}

impl WriteGate {
    /// Refuse further writes and wait out those already running.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.writes.write().await);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Everything a strategy needs, passed explicitly.
pub(crate) struct Strategies<'a> {
    pub pages: &'a Cache,
    pub assets: &'a Cache,
    pub fetcher: &'a Arc<dyn Fetcher>,
    pub offline_fallback: Option<&'a RequestKey>,
    pub revalidations: &'a Revalidations,
    /// Closed once the version is replaced.
    pub gate: &'a Arc<WriteGate>,
}

impl Strategies<'_> {
    /// Stale-while-revalidate on the pages partition.
    pub(crate) async fn page(&self, request: &Request) -> FetchResponse {
        let key = RequestKey::get(&request.url);

        if let Some(entry) = lookup(self.pages, &key).await {
            self.revalidate(request.clone(), key);
            return FetchResponse::from_cache(&entry);
        }

        match self.fetcher.fetch(request).await {
            Ok(response) if response.status == 200 => {
                store(self.gate, self.pages, &key, &response).await;
                return FetchResponse::from_network(response);
            }
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "Page fetch not cacheable, using fallback")
            }
            Err(e) => debug!(url = %request.url, error = %e, "Page fetch failed, using fallback"),
        }

        if let Some(fallback) = self.offline_fallback {
            if let Some(entry) = lookup(self.pages, fallback).await {
                return FetchResponse::from_cache(&entry);
            }
        }
        FetchResponse::offline()
    }

    /// Cache-first on the assets partition, no revalidation.
    pub(crate) async fn asset(&self, request: &Request) -> FetchResponse {
        let key = RequestKey::get(&request.url);

        if let Some(entry) = lookup(self.assets, &key).await {
            return FetchResponse::from_cache(&entry);
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                let shareable = matches!(
                    response.response_type,
                    ResponseType::Basic | ResponseType::Cors
                );
                if response.status == 200 && shareable {
                    store(self.gate, self.assets, &key, &response).await;
                }
                FetchResponse::from_network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Asset fetch failed");
                FetchResponse::network_error()
            }
        }
    }

    /// Network first, assets partition on failure.
    pub(crate) async fn network_first(&self, request: &Request) -> FetchResponse {
        let key = RequestKey::get(&request.url);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.status == 200 && response.response_type == ResponseType::Basic {
                    store(self.gate, self.assets, &key, &response).await;
                }
                FetchResponse::from_network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying assets cache");
                match lookup(self.assets, &key).await {
                    Some(entry) => FetchResponse::from_cache(&entry),
                    None => FetchResponse::offline(),
                }
            }
        }
    }

    fn revalidate(&self, request: Request, key: RequestKey) {
        let fetcher = Arc::clone(self.fetcher);
        let pages = self.pages.clone();
        let gate = Arc::clone(self.gate);

        self.revalidations.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) if response.status == 200 => {
                    store(&gate, &pages, &key, &response).await;
                    trace!(key = %key, "Page revalidated");
                }
                Ok(response) => trace!(key = %key, status = response.status, "Revalidation skipped"),
                Err(e) => trace!(key = %key, error = %e, "Revalidation failed"),
            }
        });
    }
}

/// Cache read where a storage failure counts as a miss.
async fn lookup(cache: &Cache, key: &RequestKey) -> Option<CacheEntry> {
    match cache.match_request(key).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(cache = cache.name(), key = %key, error = %e, "Cache read failed");
            None
        }
    }
}

/// Best-effort cache write.
async fn store(gate: &WriteGate, cache: &Cache, key: &RequestKey, response: &Response) {
    let _open = gate.writes.read().await;
    if gate.is_closed() {
        trace!(cache = cache.name(), key = %key, "Version retired, not caching");
        return;
    }
    if let Err(e) = cache.put(key, response).await {
        warn!(cache = cache.name(), key = %key, error = %e, "Cache write failed");
    }
}
