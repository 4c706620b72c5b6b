//! Worker versions, the registration slots holding them, and the clients
//! they control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::orchestrator::CacheOrchestrator;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Purging stale partitions.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// One version of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Asked to skip the waiting phase.
    pub skip_waiting: bool,

    /// Error message if install failed.
    pub error: Option<String>,

    orchestrator: Arc<CacheOrchestrator>,
}

impl ServiceWorker {
    pub fn new(orchestrator: Arc<CacheOrchestrator>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            error: None,
            orchestrator,
        }
    }

    pub fn version(&self) -> &str {
        self.orchestrator.version()
    }

    pub fn orchestrator(&self) -> &Arc<CacheOrchestrator> {
        &self.orchestrator
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
    }
}

// ==================== Registration ====================

/// The installing, waiting and active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Most recent version whose install failed, kept for its error.
    pub failed: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            failed: None,
        }
    }

    /// Put a new version in the installing slot.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> ServiceWorkerId {
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        self.failed = None;
        id
    }

    /// Transition installing to waiting, replacing any older waiting worker.
    pub fn install_complete(&mut self, skip_waiting: bool) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        worker.skip_waiting |= skip_waiting;

        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self, error: String) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        worker.error = Some(error);
        self.failed = Some(worker.clone());
        Some(worker)
    }

    /// Move waiting into the active slot in `Activating`; returns the
    /// previous active worker, now redundant.
    pub fn begin_activation(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let old = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        self.active = Some(worker);
        old
    }

    /// Mark the active worker as activated.
    pub fn activation_complete(&mut self) -> Option<ServiceWorkerId> {
        let worker = self.active.as_mut()?;
        worker.set_state(ServiceWorkerState::Activated);
        Some(worker.id)
    }

    /// Flag the waiting worker, or else the installing one, to skip waiting.
    ///
    /// Returns `false` when neither slot is occupied.
    pub fn skip_waiting(&mut self) -> bool {
        match self.waiting.as_mut().or(self.installing.as_mut()) {
            Some(worker) => {
                worker.skip_waiting = true;
                true
            }
            None => false,
        }
    }
}

// ==================== Clients ====================

/// A client (controlled page), identified by the host.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Worker controlling this client.
    pub controller: Option<ServiceWorkerId>,

    /// Last request seen from this client.
    pub last_seen: Instant,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a navigation from a client, which puts it under `controller`.
    ///
    /// Returns `true` when the controller changed.
    pub fn navigated(&mut self, id: &str, controller: Option<ServiceWorkerId>) -> bool {
        let client = self.clients.entry(id.to_string()).or_insert_with(|| Client {
            id: id.to_string(),
            controller: None,
            last_seen: Instant::now(),
        });
        client.last_seen = Instant::now();
        let changed = client.controller != controller;
        client.controller = controller;
        changed
    }

    /// Note a subresource request from a known client.
    pub fn touch(&mut self, id: &str) {
        if let Some(client) = self.clients.get_mut(id) {
            client.last_seen = Instant::now();
        }
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Put every client under `worker`; returns the ids that changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Forget clients with no request for at least `max_idle`; returns
    /// their ids.
    pub fn expire_idle(&mut self, max_idle: Duration) -> Vec<String> {
        let mut expired: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.last_seen.elapsed() >= max_idle)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            self.clients.remove(id);
        }
        expired.sort();
        expired
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
