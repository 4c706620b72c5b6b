//! Origin model and the CORS check used to classify responses.

use url::Url;

/// A web origin (scheme + host + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    /// An opaque origin (unique, cannot match anything).
    Opaque(String),
}

impl Origin {
    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        match url.scheme() {
            "http" | "https" => Origin::Tuple {
                scheme: url.scheme().to_string(),
                host: url.host_str().unwrap_or("").to_ascii_lowercase(),
                port: url.port_or_known_default(),
            },
            _ => Origin::Opaque(url.to_string()),
        }
    }

    /// Check if two origins are the same.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1 == h2 && p1 == p2,
            // Opaque origins are never same-origin (even with themselves)
            _ => false,
        }
    }

    /// Check whether a URL belongs to this origin.
    pub fn contains(&self, url: &Url) -> bool {
        self.same_origin(&Origin::from_url(url))
    }

    /// Check if this is a potentially trustworthy origin (HTTPS or loopback).
    pub fn is_secure(&self) -> bool {
        match self {
            Origin::Tuple { scheme, host, .. } => {
                scheme == "https"
                    || host == "localhost"
                    || host.ends_with(".localhost")
                    || host == "127.0.0.1"
                    || host == "[::1]"
            }
            Origin::Opaque(_) => false,
        }
    }

    /// Serialize to string (for the Origin header).
    pub fn serialize(&self) -> String {
        match self {
            Origin::Tuple { scheme, host, port } => {
                let default_port = match scheme.as_str() {
                    "http" => Some(80),
                    "https" => Some(443),
                    _ => None,
                };
                match port {
                    Some(p) if *port != default_port => format!("{}://{}:{}", scheme, host, p),
                    _ => format!("{}://{}", scheme, host),
                }
            }
            Origin::Opaque(_) => "null".to_string(),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// Outcome of checking a cross-origin response's CORS headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsResult {
    /// The response may be read by the requesting origin.
    Allowed,
    /// The response is not shared with the requesting origin.
    Denied(String),
}

/// Check `Access-Control-Allow-Origin` against the requesting origin.
pub fn check_cors(request_origin: &Origin, allow_origin: Option<&str>) -> CorsResult {
    match allow_origin.map(str::trim) {
        None => CorsResult::Denied("No Access-Control-Allow-Origin header".into()),
        Some("*") => CorsResult::Allowed,
        Some(allowed) if allowed == request_origin.serialize() => CorsResult::Allowed,
        Some(allowed) => CorsResult::Denied(format!(
            "Origin '{}' not allowed (allowed: '{}')",
            request_origin, allowed
        )),
    }
}
