//! Precache manifest: the app shell fetched and stored at install.

use nbs_net::Origin;
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Paths precached by default.
pub const DEFAULT_PRECACHE: [&str; 5] = [
    "/",
    "/offline.html",
    "/manifest.webmanifest",
    "/icons/nbs-icon.svg",
    "/icons/nbs-icon-maskable.svg",
];

/// Default offline fallback document.
pub const DEFAULT_OFFLINE_FALLBACK: &str = "/offline.html";

/// Ordered, de-duplicated list of same-origin URLs to precache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheManifest {
    urls: Vec<Url>,
}

impl PrecacheManifest {
    /// Resolve `entries` against `origin`.
    ///
    /// Entries resolving to another origin are rejected. Repeated entries
    /// keep their first position.
    pub fn new<I, S>(origin: &Url, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let app_origin = Origin::from_url(origin);
        let mut urls: Vec<Url> = Vec::new();

        for entry in entries {
            let entry = entry.as_ref();
            let mut url = origin.join(entry).map_err(|e| {
                ServiceWorkerError::InstallFailed(format!("bad manifest entry '{}': {}", entry, e))
            })?;
            url.set_fragment(None);

            if !app_origin.contains(&url) {
                return Err(ServiceWorkerError::SecurityError(format!(
                    "manifest entry {} is not same-origin with {}",
                    url, app_origin
                )));
            }
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        Ok(Self { urls })
    }

    /// The built-in app shell.
    pub fn default_for(origin: &Url) -> Result<Self> {
        Self::new(origin, DEFAULT_PRECACHE)
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.urls.iter()
    }
}
