//! The host-facing lifecycle driver.
//!
//! [`ServiceWorkerContainer`] owns the registration slots and the client
//! list, runs install and activate for each registered version, and routes
//! intercepted requests to whichever version is active.

use std::sync::Arc;
use std::time::Duration;

use nbs_net::{Origin, Request};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::message::ControlMessage;
use crate::orchestrator::{CacheOrchestrator, FetchOutcome};
use crate::registration::{
    Clients, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::{Result, ServiceWorkerError};

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by another version.
    ControllerChange { client_id: String, version: String },
    /// Message received.
    Message { data: String },
}

/// An intercepted request and the client that issued it.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: ServiceWorkerId,
    pub version: String,
    pub state: ServiceWorkerState,
    pub skip_waiting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ServiceWorker> for WorkerStatus {
    fn from(worker: &ServiceWorker) -> Self {
        Self {
            id: worker.id,
            version: worker.version().to_string(),
            state: worker.state,
            skip_waiting: worker.skip_waiting,
            error: worker.error.clone(),
        }
    }
}

/// Snapshot of the registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
    pub scope: String,
    pub installing: Option<WorkerStatus>,
    pub waiting: Option<WorkerStatus>,
    pub active: Option<WorkerStatus>,
    /// Last version whose install failed, until the next install starts.
    pub failed: Option<WorkerStatus>,
    pub clients: usize,
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    scope: Url,

    registration: RwLock<ServiceWorkerRegistration>,

    clients: RwLock<Clients>,

    /// Serializes activations.
    activation: Mutex<()>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container for `scope`.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope.clone())),
                scope,
                clients: RwLock::new(Clients::new()),
                activation: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            version: worker.version().to_string(),
            new_state: worker.state,
        });
    }

    fn check_scope(&self, orchestrator: &CacheOrchestrator) -> Result<()> {
        let scope_origin = Origin::from_url(&self.scope);
        if !scope_origin.is_secure() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "{} is not a secure context",
                scope_origin
            )));
        }
        let app_origin = Origin::from_url(&orchestrator.config().origin);
        if !scope_origin.same_origin(&app_origin) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "worker origin {} does not match scope {}",
                app_origin, scope_origin
            )));
        }
        Ok(())
    }

    /// Register a version: install it, then activate it if allowed.
    ///
    /// The active version keeps serving while the install runs. Registering
    /// the version that is already waiting or active is a no-op.
    pub async fn register(&self, orchestrator: Arc<CacheOrchestrator>) -> Result<ServiceWorkerId> {
        self.check_scope(&orchestrator)?;
        let version = orchestrator.version().to_string();

        let installing = {
            let mut registration = self.registration.write().await;
            if let Some(worker) = &registration.installing {
                return Err(ServiceWorkerError::RegistrationFailed(format!(
                    "version {} is already installing",
                    worker.version()
                )));
            }
            let current = registration
                .waiting
                .iter()
                .chain(registration.active.iter())
                .find(|w| w.version() == version);
            if let Some(worker) = current {
                debug!(version = %version, state = ?worker.state, "Version already registered");
                return Ok(worker.id);
            }

            registration.begin_install(ServiceWorker::new(Arc::clone(&orchestrator)));
            registration.installing.clone()
        };
        let Some(installing) = installing else {
            return Err(ServiceWorkerError::StateError("installing slot empty".to_string()));
        };
        let id = installing.id;

        info!(version = %version, "Update found, installing");
        self.emit(ServiceWorkerEvent::UpdateFound {
            version: version.clone(),
        });
        self.emit_state(&installing);

        match orchestrator.on_install().await {
            Ok(outcome) => {
                let replaced = {
                    let mut registration = self.registration.write().await;
                    let replaced = registration.install_complete(outcome.skip_waiting);
                    if let Some(replaced) = &replaced {
                        self.emit_state(replaced);
                    }
                    if let Some(waiting) = &registration.waiting {
                        self.emit_state(waiting);
                    }
                    replaced
                };
                if let Some(replaced) = replaced {
                    replaced.orchestrator().retire().await;
                }
                self.try_activate().await?;
                Ok(id)
            }
            Err(e) => {
                let failed = self.registration.write().await.install_failed(e.to_string());
                if let Some(failed) = failed {
                    self.emit_state(&failed);
                    failed.orchestrator().retire().await;
                }
                Err(e)
            }
        }
    }

    /// Activate the waiting version if it may take over now.
    ///
    /// It may when it asked to skip waiting, when nothing is active, or when
    /// no client is controlled by the active version.
    pub async fn try_activate(&self) -> Result<bool> {
        let _guard = self.activation.lock().await;

        let ready = {
            let registration = self.registration.read().await;
            let Some(waiting) = &registration.waiting else {
                return Ok(false);
            };
            match &registration.active {
                None => true,
                Some(active) => {
                    waiting.skip_waiting || self.clients.read().await.controlled_by(active.id) == 0
                }
            }
        };

        if !ready {
            debug!("Waiting version held back by controlled clients");
            return Ok(false);
        }
        self.activate_waiting().await
    }

    /// Activation proper; the caller holds the activation guard.
    async fn activate_waiting(&self) -> Result<bool> {
        let (next, previous) = {
            let mut registration = self.registration.write().await;
            let previous = registration.begin_activation();
            (registration.active.clone(), previous)
        };
        let Some(next) = next else {
            return Ok(false);
        };

        // The old version must have no write left in flight before the
        // sweep, or it could recreate a partition the sweep deletes.
        if let Some(previous) = &previous {
            previous.orchestrator().retire().await;
            self.emit_state(previous);
        }
        self.emit_state(&next);

        match next.orchestrator().on_activate().await {
            Ok(outcome) => {
                info!(version = %next.version(), deleted = ?outcome.deleted, "Stale partitions purged")
            }
            Err(e) => warn!(version = %next.version(), error = %e, "Stale partition purge incomplete"),
        }

        let activated = {
            let mut registration = self.registration.write().await;
            registration.activation_complete();
            registration.active.clone()
        };
        if let Some(activated) = &activated {
            self.emit_state(activated);
        }

        let claimed = self.clients.write().await.claim(next.id);
        for client_id in claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                version: next.version().to_string(),
            });
        }

        info!(version = %next.version(), "Version activated");
        Ok(true)
    }

    /// Deliver a message from a page.
    ///
    /// `SKIP_WAITING` flags the waiting (or installing) version and
    /// activates it if it is waiting. Returns whether an activation ran.
    pub async fn post_message(&self, data: &str) -> Result<bool> {
        self.emit(ServiceWorkerEvent::Message {
            data: data.to_string(),
        });

        match ControlMessage::parse(data) {
            Some(ControlMessage::SkipWaiting) => {
                let flagged = self.registration.write().await.skip_waiting();
                if !flagged {
                    debug!("Skip waiting with no pending version");
                    return Ok(false);
                }
                self.try_activate().await
            }
            None => Ok(false),
        }
    }

    /// Route an intercepted request to the active version.
    ///
    /// With nothing active the request is handed back untouched.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchOutcome {
        let active = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| (w.id, w.version().to_string(), Arc::clone(w.orchestrator())));

        if let Some(client_id) = &event.client_id {
            let mut clients = self.clients.write().await;
            if event.request.is_navigation() {
                let controller = active.as_ref().map(|(id, _, _)| *id);
                let changed = clients.navigated(client_id, controller);
                if let (true, Some((_, version, _))) = (changed, &active) {
                    self.emit(ServiceWorkerEvent::ControllerChange {
                        client_id: client_id.clone(),
                        version: version.clone(),
                    });
                }
            } else {
                clients.touch(client_id);
            }
        }

        match active {
            Some((_, _, orchestrator)) => orchestrator.on_fetch(event.request).await,
            None => FetchOutcome::Passthrough(event.request),
        }
    }

    /// Forget a client that went away, then retry activation.
    pub async fn client_unloaded(&self, client_id: &str) -> Result<bool> {
        if self.clients.write().await.remove(client_id).is_none() {
            return Ok(false);
        }
        debug!(client_id, "Client unloaded");
        self.try_activate().await
    }

    /// Forget clients idle for at least `max_idle`, then retry activation
    /// if any went.
    ///
    /// Hosts that cannot observe a page closing use this in place of
    /// [`client_unloaded`](Self::client_unloaded).
    pub async fn expire_idle_clients(&self, max_idle: Duration) -> Result<bool> {
        let expired = self.clients.write().await.expire_idle(max_idle);
        if expired.is_empty() {
            return Ok(false);
        }
        debug!(count = expired.len(), ?expired, "Idle clients expired");
        self.try_activate().await
    }

    /// Adopt a version that was already active before a restart.
    ///
    /// No install or purge runs.
    pub async fn restore_active(&self, orchestrator: Arc<CacheOrchestrator>) -> Result<ServiceWorkerId> {
        self.check_scope(&orchestrator)?;

        let mut registration = self.registration.write().await;
        if let Some(active) = &registration.active {
            return Err(ServiceWorkerError::StateError(format!(
                "version {} is already active",
                active.version()
            )));
        }

        let mut worker = ServiceWorker::new(orchestrator);
        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;
        info!(version = %worker.version(), "Restored active version");
        self.emit_state(&worker);
        registration.active = Some(worker);
        Ok(id)
    }

    /// The active version's orchestrator.
    pub async fn active(&self) -> Option<Arc<CacheOrchestrator>> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(w.orchestrator()))
    }

    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.version().to_string())
    }

    /// Snapshot for status reporting.
    pub async fn status(&self) -> RegistrationStatus {
        let registration = self.registration.read().await;
        let clients = self.clients.read().await.len();
        RegistrationStatus {
            scope: registration.scope.to_string(),
            installing: registration.installing.as_ref().map(WorkerStatus::from),
            waiting: registration.waiting.as_ref().map(WorkerStatus::from),
            active: registration.active.as_ref().map(WorkerStatus::from),
            failed: registration.failed.as_ref().map(WorkerStatus::from),
            clients,
        }
    }

    /// Cancel background work of every version.
    pub async fn shutdown(&self) {
        let registration = self.registration.read().await;
        for worker in registration
            .installing
            .iter()
            .chain(registration.waiting.iter())
            .chain(registration.active.iter())
        {
            worker.orchestrator().shutdown();
        }
        debug!("Service worker container shut down");
    }
}
