//! Network seam and the response handed back to the host.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use nbs_net::{NetError, Request, ResourceLoader, Response, ResponseType};

use crate::cache::CacheEntry;

/// Performs network fetches on behalf of the orchestrator.
///
/// A received response of any status is `Ok`; `Err` means no response was
/// received at all.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        ResourceLoader::fetch(self, request).await
    }
}

/// Where a [`FetchResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Built locally: offline 503 or network error.
    Synthesized,
}

/// Fetch event response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code; 0 for a network error.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Response type.
    pub response_type: ResponseType,

    /// Where the response came from.
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            response_type: ResponseType::Error,
            source: ResponseSource::Synthesized,
        }
    }

    /// The minimal response served when neither cache nor network can help.
    pub fn offline() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        Self {
            status: 503,
            status_text: "Service Unavailable".to_string(),
            headers,
            body: Bytes::from_static(b"Offline"),
            response_type: ResponseType::Basic,
            source: ResponseSource::Synthesized,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: entry.status_text.clone(),
            headers: entry.header_map(),
            body: entry.body(),
            response_type: entry.response_type(),
            source: ResponseSource::Cache,
        }
    }

    /// Wrap a network response.
    pub fn from_network(response: Response) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body,
            response_type: response.response_type,
            source: ResponseSource::Network,
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.response_type == ResponseType::Error
    }

    pub fn from_cache_hit(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn test_offline_response() {
        let response = FetchResponse::offline();
        assert_eq!(response.status, 503);
        assert_eq!(response.status_text, "Service Unavailable");
        assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(&response.body[..], b"Offline");
        assert_eq!(response.source, ResponseSource::Synthesized);
    }

    #[test]
    fn test_network_error_response() {
        let response = FetchResponse::network_error();
        assert_eq!(response.status, 0);
        assert!(response.is_network_error());
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_from_cache_keeps_snapshot() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("image/svg+xml"));
        let entry = CacheEntry::from_response(&Response {
            url: Url::parse("http://localhost/icons/nbs-icon.svg").unwrap(),
            status: 200,
            status_text: "OK".to_string(),
            headers,
            body: Bytes::from_static(b"<svg/>"),
            response_type: ResponseType::Basic,
        });

        let response = FetchResponse::from_cache(&entry);
        assert_eq!(response.status, 200);
        assert!(response.from_cache_hit());
        assert_eq!(response.headers.get("content-type").unwrap(), "image/svg+xml");
        assert_eq!(&response.body[..], b"<svg/>");
    }
}
