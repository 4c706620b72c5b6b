//! # NBS Service Worker
//!
//! Offline cache orchestration for the NBS app, modelled on the service
//! worker lifecycle but driven by an explicit handler interface instead of
//! host-dispatched events.
//!
//! ## Features
//!
//! - **Lifecycle**: install (atomic precache), activate (stale partition
//!   sweep, client claim), skip-waiting control signal
//! - **Cache API**: versioned partitions over memory or disk backends
//! - **Routing**: ordered `(predicate, route)` table evaluated before any I/O
//! - **Strategies**: stale-while-revalidate pages, cache-first assets,
//!   network-first everything else
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker ─► CacheOrchestrator)
//!     │       ├── waiting
//!     │       └── active
//!     └── Clients
//!
//! CacheOrchestrator
//!     ├── Router ─► Route
//!     ├── Strategies ─► Cache "{prefix}-pages-{version}"
//!     │             └─► Cache "{prefix}-assets-{version}"
//!     └── Fetcher (network)
//! ```

use nbs_common::NbsError;
use nbs_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod container;
pub mod disk;
pub mod fetch;
pub mod manifest;
pub mod message;
pub mod naming;
pub mod orchestrator;
pub mod registration;
pub mod route;
mod strategy;

pub use cache::{
    Cache, CacheBackend, CacheEntry, CachedHeader, CacheStorage, MemoryBackend, RequestKey,
};
pub use container::{
    FetchEvent, RegistrationStatus, ServiceWorkerContainer, ServiceWorkerEvent, WorkerStatus,
};
pub use disk::DiskBackend;
pub use fetch::{FetchResponse, Fetcher, ResponseSource};
pub use manifest::PrecacheManifest;
pub use message::ControlMessage;
pub use naming::{CacheNames, PartitionKind};
pub use orchestrator::{
    ActivateOutcome, CacheOrchestrator, FetchOutcome, InstallOutcome, OrchestratorConfig,
};
pub use registration::{
    Client, Clients, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use route::{PassthroughReason, Route, RoutePredicate, RouteRule, Router};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid cache name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Storage(#[from] NbsError),
}

impl From<NetError> for ServiceWorkerError {
    fn from(e: NetError) -> Self {
        ServiceWorkerError::NetworkError(e.to_string())
    }
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
