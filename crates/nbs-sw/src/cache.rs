//! Cache API: partitions of request → response snapshots.
//!
//! [`CacheStorage`] plays the role of the `caches` global and [`Cache`] is a
//! handle on one named partition. Both delegate to a [`CacheBackend`], which
//! must make every single-key `put`/`get` atomic; nothing here locks across
//! keys, so concurrent writers to one key resolve last-writer-wins.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use nbs_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("GET {}", url))
    }

    /// Key for a request; only reads are ever cached.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL part of the key.
    pub fn url(&self) -> &str {
        self.0.split_once(' ').map(|(_, url)| url).unwrap_or(&self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One response header; the value is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    pub name: String,
    #[serde(with = "bytes_base64")]
    pub value: Vec<u8>,
}

/// Headers never written into a snapshot.
const UNCACHEABLE_HEADERS: [&str; 2] = ["set-cookie", "set-cookie2"];

/// A cached response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in order.
    pub headers: Vec<CachedHeader>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Vec<u8>,

    /// `basic`, `cors` or `opaque`.
    pub response_type: String,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a network response.
    ///
    /// `Set-Cookie` and `Set-Cookie2` are left out.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter(|(name, _)| !UNCACHEABLE_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| CachedHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            url: response.url.to_string(),
            method: Method::GET.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            response_type: response.response_type.as_str().to_string(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the header map.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                map.append(n, v);
            }
        }
        map
    }

    pub fn response_type(&self) -> ResponseType {
        ResponseType::from_name(&self.response_type).unwrap_or(ResponseType::Basic)
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Backend ====================

/// Storage behind [`CacheStorage`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create a partition; returns `true` if it did not exist.
    async fn create(&self, cache: &str) -> Result<bool>;

    /// Check if a partition exists.
    async fn has(&self, cache: &str) -> Result<bool>;

    /// Delete a partition and all its entries.
    async fn delete(&self, cache: &str) -> Result<bool>;

    /// All partition names, sorted.
    async fn names(&self) -> Result<Vec<String>>;

    /// Look up one entry.
    async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

    /// Store one entry, creating the partition if needed.
    async fn put(&self, cache: &str, key: &RequestKey, entry: CacheEntry) -> Result<()>;

    /// Remove one entry.
    async fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool>;

    /// All keys of a partition, sorted.
    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, HashMap<RequestKey, CacheEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn create(&self, cache: &str) -> Result<bool> {
        let mut caches = self.caches.write().await;
        if caches.contains_key(cache) {
            return Ok(false);
        }
        caches.insert(cache.to_string(), HashMap::new());
        Ok(true)
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, cache: &str, key: &RequestKey, entry: CacheEntry) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default()
            .insert(key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, cache: &str, key: &RequestKey) -> Result<bool> {
        Ok(self
            .caches
            .write()
            .await
            .get_mut(cache)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>> {
        let mut keys: Vec<RequestKey> = self
            .caches
            .read()
            .await
            .get(cache)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

// ==================== Cache ====================

/// Handle on one named partition.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

impl Cache {
    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request key.
    pub async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
        self.backend.get(&self.name, key).await
    }

    /// Store a response snapshot, replacing any previous one.
    ///
    /// Only status 200 responses may be stored.
    pub async fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
        if response.status != 200 {
            return Err(ServiceWorkerError::CacheError(format!(
                "refusing to cache {} with status {}",
                key, response.status
            )));
        }
        self.backend
            .put(&self.name, key, CacheEntry::from_response(response))
            .await
    }

    /// Delete entry.
    pub async fn delete(&self, key: &RequestKey) -> Result<bool> {
        self.backend.remove(&self.name, key).await
    }

    /// Get all keys.
    pub async fn keys(&self) -> Result<Vec<RequestKey>> {
        self.backend.keys(&self.name).await
    }
}

// ==================== Cache Storage ====================

/// Cache storage (caches global).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        self.backend.create(name).await?;
        Ok(self.cache(name))
    }

    /// Handle on a cache without creating it; the first `put` does.
    pub fn cache(&self, name: &str) -> Cache {
        Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.backend.delete(name).await
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.names().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str, status: u16, body: &'static str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        Response {
            url: Url::parse(url).unwrap(),
            status,
            status_text: nbs_net::reason_phrase(status).to_string(),
            headers,
            body: Bytes::from_static(body.as_bytes()),
            response_type: ResponseType::Basic,
        }
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::get(&Url::parse("http://localhost/page#intro").unwrap());
        let b = RequestKey::get(&Url::parse("http://localhost/page").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET http://localhost/page");
        assert_eq!(a.url(), "http://localhost/page");
    }

    #[test]
    fn test_request_key_keeps_query() {
        let a = RequestKey::get(&Url::parse("http://localhost/?preset=quick").unwrap());
        let b = RequestKey::get(&Url::parse("http://localhost/").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_key_only_for_reads() {
        let url = Url::parse("http://localhost/sessions").unwrap();
        assert!(RequestKey::for_request(&Request::get(url.clone())).is_some());
        assert!(RequestKey::for_request(&Request::new(Method::POST, url)).is_none());
    }

    #[test]
    fn test_snapshot_keeps_non_ascii_header_values() {
        let mut original = response("http://localhost/report.txt", 200, "data");
        let disposition = HeaderValue::from_bytes(b"attachment; filename=\"caf\xc3\xa9.txt\"").unwrap();
        original
            .headers
            .insert("content-disposition", disposition.clone());
        original
            .headers
            .append("link", HeaderValue::from_static("</a.css>; rel=preload"));
        original
            .headers
            .append("link", HeaderValue::from_static("</b.js>; rel=preload"));

        let entry = CacheEntry::from_response(&original);
        let json = serde_json::to_string(&entry).unwrap();
        let restored: CacheEntry = serde_json::from_str(&json).unwrap();
        let headers = restored.header_map();

        assert_eq!(headers.get("content-disposition"), Some(&disposition));
        assert_eq!(headers.get_all("link").iter().count(), 2);
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn test_snapshot_drops_set_cookie() {
        let mut original = response("http://localhost/", 200, "home");
        original
            .headers
            .insert("set-cookie", HeaderValue::from_static("session=abc; HttpOnly"));
        original
            .headers
            .insert("set-cookie2", HeaderValue::from_static("legacy=1"));

        let headers = CacheEntry::from_response(&original).header_map();
        assert!(!headers.contains_key("set-cookie"));
        assert!(!headers.contains_key("set-cookie2"));
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_entry_round_trip_through_json() {
        let entry = CacheEntry::from_response(&response("http://localhost/", 200, "<h1>hi</h1>"));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("PGgxPmhpPC9oMT4="));

        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.header_map().get("content-type").unwrap(), "text/html");
        assert_eq!(back.response_type(), ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_cache_put_and_match() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("nbs-pwa-pages-v2").await.unwrap();
        let key = RequestKey::get(&Url::parse("http://localhost/").unwrap());

        cache.put(&key, &response("http://localhost/", 200, "A")).await.unwrap();
        cache.put(&key, &response("http://localhost/", 200, "B")).await.unwrap();

        let entry = cache.match_request(&key).await.unwrap().unwrap();
        assert_eq!(entry.body, b"B");
        assert_eq!(cache.keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_cache_rejects_non_200() {
        let storage = CacheStorage::in_memory();
        let cache = storage.cache("nbs-pwa-assets-v2");
        let key = RequestKey::get(&Url::parse("http://localhost/missing").unwrap());

        for status in [201, 204, 304, 404, 500] {
            let result = cache.put(&key, &response("http://localhost/missing", status, "")).await;
            assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        }
        assert!(!storage.has("nbs-pwa-assets-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_lazy_creation_on_put() {
        let storage = CacheStorage::in_memory();
        let cache = storage.cache("nbs-pwa-assets-v2");
        assert!(!storage.has("nbs-pwa-assets-v2").await.unwrap());

        let key = RequestKey::get(&Url::parse("http://localhost/icons/a.svg").unwrap());
        cache
            .put(&key, &response("http://localhost/icons/a.svg", 200, "<svg/>"))
            .await
            .unwrap();
        assert!(storage.has("nbs-pwa-assets-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_storage_keys_and_delete() {
        let storage = CacheStorage::in_memory();
        storage.open("b").await.unwrap();
        storage.open("a").await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["a", "b"]);
        assert!(storage.delete("a").await.unwrap());
        assert!(!storage.delete("a").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_cache_delete_entry() {
        let storage = CacheStorage::in_memory();
        let cache = storage.open("pages").await.unwrap();
        let key = RequestKey::get(&Url::parse("http://localhost/").unwrap());
        cache.put(&key, &response("http://localhost/", 200, "A")).await.unwrap();

        assert!(cache.delete(&key).await.unwrap());
        assert!(cache.match_request(&key).await.unwrap().is_none());
    }
}
