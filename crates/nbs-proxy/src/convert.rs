//! Conversions between axum messages and the worker's request/response
//! model.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use nbs_net::{strip_hop_by_hop, Origin, Request, RequestMode};
use nbs_sw::{FetchResponse, ResponseSource};
use url::Url;

use crate::ProxyError;

/// Header telling the client whether the response came from a cache.
pub const CACHE_STATUS_HEADER: &str = "x-sw-cache";

/// Turn an incoming request into the worker's request.
///
/// Origin-form targets (`/path?query`) are resolved against the public
/// origin; absolute-form targets are kept as they are, and refused when
/// they name another origin unless `allow_cross_origin` is set.
pub fn to_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    origin: &Url,
    allow_cross_origin: bool,
) -> Result<Request, ProxyError> {
    let url = if uri.scheme().is_some() {
        Url::parse(&uri.to_string())
    } else {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        origin.join(target)
    }
    .map_err(|e| ProxyError::InvalidRequest(format!("bad target '{}': {}", uri, e)))?;

    if !allow_cross_origin && !Origin::from_url(origin).same_origin(&Origin::from_url(&url)) {
        return Err(ProxyError::CrossOrigin(url.to_string()));
    }

    let mut forwarded = headers.clone();
    strip_hop_by_hop(&mut forwarded);

    let mut request = Request::new(method.clone(), url).mode(RequestMode::from_headers(method, headers));
    request.headers = forwarded;
    if !body.is_empty() {
        request = request.body(body);
    }
    Ok(request)
}

/// Render a worker response.
///
/// A network error (status 0) becomes `502 Bad Gateway`.
pub fn into_response(response: FetchResponse) -> Response {
    let cache_status = if response.source == ResponseSource::Cache {
        "hit"
    } else {
        "miss"
    };

    if response.is_network_error() {
        let mut rendered = StatusCode::BAD_GATEWAY.into_response();
        rendered
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache_status));
        return rendered;
    }

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = response.headers;
    strip_hop_by_hop(&mut headers);
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache_status));

    let mut rendered = Response::new(Body::from(response.body));
    *rendered.status_mut() = status;
    *rendered.headers_mut() = headers;
    rendered
}
