//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{NbsError, Result};

/// Top-level configuration for the offline cache proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    pub listen: String,

    /// Origin the browser sees (scope of the cache); same-origin checks use it
    pub origin: String,

    /// Origin server that same-origin requests are forwarded to
    pub upstream: String,

    /// Cache partition settings
    pub cache: CacheSection,

    /// Paths fetched and stored at install time
    pub precache: Vec<String>,

    /// Page served when a navigation can be satisfied neither from cache nor network
    pub offline_fallback: String,

    /// Same-origin path prefixes served cache-first from the assets partition
    pub asset_prefixes: Vec<String>,

    /// Activate a freshly installed version without waiting for clients
    pub skip_waiting_on_install: bool,

    /// Path prefix of the control endpoints (message, status, update)
    pub control_path: String,

    /// Upstream request timeout in seconds; unset leaves it to the OS
    pub upstream_timeout_secs: Option<u64>,

    /// Seconds without a request after which a client stops holding a
    /// waiting version back; 0 keeps clients until restart, so a waiting
    /// version then only activates through a `SKIP_WAITING` message
    pub client_idle_secs: u64,

    /// Forward absolute-form requests for other origins (open proxy)
    pub allow_cross_origin: bool,

    /// Logging settings
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSection {
    /// Application prefix shared by every partition name
    pub prefix: String,

    /// Version tag; bumping it invalidates all earlier partitions
    pub version: String,

    /// Directory holding persisted partitions
    pub dir: PathBuf,

    /// Keep partitions on disk (false = in memory only)
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    /// Level used when no filter is given
    pub level: String,

    /// pretty, compact or json
    pub format: String,

    /// Optional `EnvFilter` directive string
    pub filter: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            origin: "http://127.0.0.1:8080".to_string(),
            upstream: "http://127.0.0.1:3000".to_string(),
            cache: CacheSection::default(),
            precache: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/manifest.webmanifest".to_string(),
                "/icons/nbs-icon.svg".to_string(),
                "/icons/nbs-icon-maskable.svg".to_string(),
            ],
            offline_fallback: "/offline.html".to_string(),
            asset_prefixes: vec!["/_next/".to_string(), "/icons/".to_string()],
            skip_waiting_on_install: true,
            control_path: "/__sw".to_string(),
            upstream_timeout_secs: None,
            client_idle_secs: 30 * 60,
            allow_cross_origin: false,
            log: LogSection::default(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            prefix: "nbs-pwa".to_string(),
            version: "v2".to_string(),
            dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nbs-proxy"),
            persistent: true,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            filter: None,
        }
    }
}

impl ProxyConfig {
    /// Load a configuration file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NbsError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        let config: ProxyConfig = serde_json::from_str(&raw).map_err(|e| {
            NbsError::config_with_source(format!("cannot parse {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.cache.prefix.is_empty() {
            return Err(NbsError::config("cache.prefix must not be empty"));
        }
        if self.cache.version.is_empty() {
            return Err(NbsError::config("cache.version must not be empty"));
        }
        if !self.offline_fallback.starts_with('/') {
            return Err(NbsError::config(format!(
                "offline_fallback '{}' must be an absolute path",
                self.offline_fallback
            )));
        }
        if let Some(entry) = self.precache.iter().find(|p| !p.starts_with('/')) {
            return Err(NbsError::config(format!(
                "precache entry '{}' must be an absolute path",
                entry
            )));
        }
        if !self.control_path.starts_with('/') || self.control_path.ends_with('/') {
            return Err(NbsError::config(format!(
                "control_path '{}' must start with '/' and not end with one",
                self.control_path
            )));
        }
        if self.upstream_timeout_secs == Some(0) {
            return Err(NbsError::config("upstream_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// File recording the active version between restarts.
    pub fn registration_file(&self) -> PathBuf {
        self.cache.dir.join("registration.json")
    }
}
