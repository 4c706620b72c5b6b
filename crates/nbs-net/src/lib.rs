//! # NBS Net
//!
//! HTTP request/response model and upstream loading for the NBS offline
//! cache proxy.
//!
//! ## Design Goals
//!
//! 1. **Plain data**: requests and responses are owned values that can be
//!    cloned into background tasks and snapshotted into caches
//! 2. **Origin aware**: every response is classified as `basic`, `cors` or
//!    `opaque` relative to the app origin, as a browser would
//! 3. **Upstream mapping**: same-origin URLs are sent to the configured
//!    origin server; cross-origin URLs go out unchanged

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod origin;

pub use origin::{check_cors, CorsResult, Origin};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as reported by `Sec-Fetch-Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin only subresource fetch.
    SameOrigin,
    /// CORS fetch (`fetch()`, module scripts, crossorigin attributes).
    #[default]
    Cors,
    /// Classic subresource fetch (images, scripts without crossorigin).
    NoCors,
}

impl RequestMode {
    /// Derive the mode from request headers.
    ///
    /// Clients that do not send `Sec-Fetch-Mode` are treated as navigating
    /// when a `GET` prefers `text/html`.
    pub fn from_headers(method: &Method, headers: &HeaderMap) -> Self {
        let fetch_mode = headers
            .get("sec-fetch-mode")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        match fetch_mode.as_deref() {
            Some("navigate") => RequestMode::Navigate,
            Some("same-origin") => RequestMode::SameOrigin,
            Some("no-cors") => RequestMode::NoCors,
            Some(_) => RequestMode::Cors,
            None => {
                let wants_html = headers
                    .get(header::ACCEPT)
                    .and_then(|v| v.to_str().ok())
                    .map(|accept| accept.trim_start().starts_with("text/html"))
                    .unwrap_or(false);
                if *method == Method::GET && wants_html {
                    RequestMode::Navigate
                } else {
                    RequestMode::NoCors
                }
            }
        }
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a request with an explicit method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a navigation (document) GET request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a full-page load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// How a response may be used by the page that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response shared via CORS.
    Cors,
    /// Cross-origin response not shared with the page.
    Opaque,
    /// Network error.
    Error,
}

impl ResponseType {
    /// Parse the lowercase name produced by [`ResponseType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

/// HTTP response, fully buffered.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Remove connection-scoped headers before forwarding a message.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Origin the browser sees.
    pub origin: Url,
    /// Where same-origin requests are actually sent.
    pub upstream: Option<Url>,
    /// User agent used when the client did not send one.
    pub user_agent: String,
    /// Request timeout; `None` leaves it to the OS.
    pub timeout: Option<Duration>,
    /// Follow redirects instead of handing them to the client.
    pub follow_redirects: bool,
}

impl LoaderConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            upstream: None,
            user_agent: format!("nbs-proxy/{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
            follow_redirects: false,
        }
    }

    pub fn upstream(mut self, upstream: Url) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: reqwest::Client,
    config: LoaderConfig,
    origin: Origin,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        let origin = Origin::from_url(&config.origin);
        info!(origin = %origin, upstream = ?config.upstream.as_ref().map(Url::as_str), "ResourceLoader initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    /// The app origin responses are classified against.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Map a request URL onto the URL actually requested.
    pub fn upstream_url(&self, url: &Url) -> Result<Url, NetError> {
        let upstream = match self.config.upstream {
            Some(ref upstream) if self.origin.contains(url) => upstream,
            _ => return Ok(url.clone()),
        };

        let invalid = || NetError::InvalidUrl(format!("cannot map {} onto {}", url, upstream));
        let mut target = url.clone();
        target.set_scheme(upstream.scheme()).map_err(|_| invalid())?;
        target.set_host(upstream.host_str()).map_err(|_| invalid())?;
        target.set_port(upstream.port()).map_err(|_| invalid())?;
        target.set_fragment(None);
        Ok(target)
    }

    /// Fetch a request. Any received status is a success at this layer.
    pub async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let target = self.upstream_url(&request.url)?;
        debug!(
            request_id = request.id.raw(),
            url = %request.url,
            target = %target,
            method = %request.method,
            "Fetching resource"
        );

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let mut req_builder = self
            .client
            .request(request.method.clone(), target)
            .headers(headers);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        let response_type = self.classify(request, &headers);

        trace!(
            request_id = request.id.raw(),
            url = %request.url,
            status = %status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: request.url.clone(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            response_type,
        })
    }

    fn classify(&self, request: &Request, headers: &HeaderMap) -> ResponseType {
        if request.is_navigation() || self.origin.contains(&request.url) {
            return ResponseType::Basic;
        }
        let allow_origin = headers
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok());
        match check_cors(&self.origin, allow_origin) {
            CorsResult::Allowed => ResponseType::Cors,
            CorsResult::Denied(reason) => {
                trace!(url = %request.url, %reason, "Cross-origin response is opaque");
                ResponseType::Opaque
            }
        }
    }

    fn map_error(&self, error: reqwest::Error) -> NetError {
        if error.is_timeout() {
            NetError::Timeout(self.config.timeout.unwrap_or_default())
        } else if error.is_connect() {
            NetError::ConnectionFailed(error.to_string())
        } else {
            NetError::HttpError(error)
        }
    }
}

/// Canonical reason phrase for a status code, empty when unknown.
pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_request_builder() {
        let url = Url::parse("http://localhost:8080/data.json").unwrap();
        let request = Request::get(url.clone()).header(
            header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
        assert!(Request::navigate(url).is_navigation());
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_mode_from_sec_fetch_mode() {
        let get = Method::GET;
        assert_eq!(
            RequestMode::from_headers(&get, &headers(&[("sec-fetch-mode", "navigate")])),
            RequestMode::Navigate
        );
        assert_eq!(
            RequestMode::from_headers(&get, &headers(&[("sec-fetch-mode", "no-cors")])),
            RequestMode::NoCors
        );
        assert_eq!(
            RequestMode::from_headers(&get, &headers(&[("sec-fetch-mode", "same-origin")])),
            RequestMode::SameOrigin
        );
        assert_eq!(
            RequestMode::from_headers(&get, &headers(&[("sec-fetch-mode", "cors")])),
            RequestMode::Cors
        );
    }

    #[test]
    fn test_mode_accept_fallback() {
        let html = headers(&[("accept", "text/html,application/xhtml+xml")]);
        assert_eq!(
            RequestMode::from_headers(&Method::GET, &html),
            RequestMode::Navigate
        );
        assert_eq!(
            RequestMode::from_headers(&Method::POST, &html),
            RequestMode::NoCors
        );
        assert_eq!(
            RequestMode::from_headers(&Method::GET, &headers(&[("accept", "*/*")])),
            RequestMode::NoCors
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut map = headers(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("content-type", "text/html"),
            ("host", "localhost"),
        ]);
        strip_hop_by_hop(&mut map);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("content-type"));
    }

    #[test]
    fn test_upstream_url_mapping() {
        let config = LoaderConfig::new(Url::parse("http://localhost:8080").unwrap())
            .upstream(Url::parse("http://127.0.0.1:3000").unwrap());
        let loader = ResourceLoader::new(config).unwrap();

        let same = Url::parse("http://localhost:8080/_next/app.js?v=1#top").unwrap();
        assert_eq!(
            loader.upstream_url(&same).unwrap().as_str(),
            "http://127.0.0.1:3000/_next/app.js?v=1"
        );

        let foreign = Url::parse("https://cdn.example.com/font.woff2").unwrap();
        assert_eq!(loader.upstream_url(&foreign).unwrap(), foreign);
    }

    #[test]
    fn test_reason_phrase() {
        assert_eq!(reason_phrase(503), "Service Unavailable");
        assert_eq!(reason_phrase(0), "");
    }
}
