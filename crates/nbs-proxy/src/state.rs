//! Which version was active, kept across restarts.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nbs_common::{NbsError, ResultExt};
use nbs_sw::{ServiceWorkerEvent, ServiceWorkerState};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Contents of `registration.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Partition prefix the version belongs to.
    pub prefix: String,
    /// Active version tag.
    pub version: String,
    /// Activation time (ms since epoch).
    pub activated_at: u64,
}

/// Reads and writes the registration record.
#[derive(Debug, Clone)]
pub struct RegistrationStore {
    path: PathBuf,
    prefix: String,
}

impl RegistrationStore {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded version, if one was saved for this prefix.
    pub async fn load(&self) -> nbs_common::Result<Option<RegistrationRecord>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NbsError::storage(&self.path, e.to_string())),
        };
        let record: RegistrationRecord = serde_json::from_slice(&raw).with_path(&self.path)?;
        if record.prefix != self.prefix {
            debug!(recorded = %record.prefix, configured = %self.prefix, "Ignoring record for another prefix");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Record `version` as active.
    pub async fn save(&self, version: &str) -> nbs_common::Result<RegistrationRecord> {
        let record = RegistrationRecord {
            prefix: self.prefix.clone(),
            version: version.to_string(),
            activated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_path(parent)?;
        }
        let json = serde_json::to_vec_pretty(&record)?;
        let temp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        tokio::fs::write(&temp, json).await.with_path(&temp)?;
        tokio::fs::rename(&temp, &self.path).await.with_path(&self.path)?;
        Ok(record)
    }
}

/// Log container events and record every activation.
///
/// Runs until the container is dropped.
pub async fn record_activations(
    mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    store: RegistrationStore,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceWorkerEvent::StateChange {
                version,
                new_state: ServiceWorkerState::Activated,
                ..
            } => match store.save(&version).await {
                Ok(_) => info!(version = %version, path = %store.path().display(), "Active version recorded"),
                Err(e) => warn!(version = %version, category = e.category(), error = %e, "Could not record active version"),
            },
            ServiceWorkerEvent::StateChange {
                version, new_state, ..
            } => debug!(version = %version, state = ?new_state, "Worker state changed"),
            ServiceWorkerEvent::UpdateFound { version } => {
                info!(version = %version, "Update found")
            }
            ServiceWorkerEvent::ControllerChange { client_id, version } => {
                debug!(client_id = %client_id, version = %version, "Controller changed")
            }
            ServiceWorkerEvent::Message { data } => debug!(len = data.len(), "Message posted"),
        }
    }
}
