//! Convenience responses built from the request they answer.
//!
//! Each helper copies the request's HTTP version and keep-alive choice so the
//! connection keeps or drops the way the client asked.

use http::header::{CONNECTION, CONTENT_TYPE, LOCATION, SERVER};
use http::{HeaderMap, HeaderValue, StatusCode, Version};

use crate::http::request::{Request, RequestExt};
use crate::http::response::Response;

/// Value of the `Server` header on every generated response.
pub const SERVER_NAME: &str = concat!("web-session/", env!("CARGO_PKG_VERSION"));

fn prepare_head(headers: &mut HeaderMap, version: Version, keep_alive: bool, content_type: &str) {
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    set_keep_alive(headers, version, keep_alive);
}

fn set_keep_alive(headers: &mut HeaderMap, version: Version, keep_alive: bool) {
    if version >= Version::HTTP_11 && !keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    } else if version < Version::HTTP_11 && keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

/// Text response with the given status and content type.
pub fn string_response(
    req: &Request,
    text: &str,
    status: StatusCode,
    content_type: &str,
) -> Response {
    let mut res = http::Response::new(text.to_owned());
    *res.status_mut() = status;
    *res.version_mut() = req.version();
    prepare_head(res.headers_mut(), req.version(), req.keep_alive(), content_type);
    Response::Text(res)
}

pub fn not_found_response(req: &Request, text: &str) -> Response {
    string_response(req, text, StatusCode::NOT_FOUND, "text/html")
}

pub fn server_error_response(req: &Request, text: &str) -> Response {
    string_response(req, text, StatusCode::INTERNAL_SERVER_ERROR, "text/html")
}

pub fn bad_request_response(req: &Request, text: &str) -> Response {
    string_response(req, text, StatusCode::BAD_REQUEST, "text/html")
}

/// Head-only response.
pub fn empty_response(req: &Request, status: StatusCode) -> Response {
    let mut res = http::Response::new(());
    *res.status_mut() = status;
    *res.version_mut() = req.version();
    prepare_head(res.headers_mut(), req.version(), req.keep_alive(), "text/html");
    Response::Empty(res)
}

/// Redirect to `location`; the body is the status reason phrase.
pub fn moved_response(req: &Request, location: &str, status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or_default();
    let mut res = string_response(req, reason, status, "text/html");
    if let Ok(value) = HeaderValue::from_str(location) {
        res.headers_mut().insert(LOCATION, value);
    }
    res
}

/// Response for a request that could not be read; always closes the connection.
pub fn error_response(version: Version, status: StatusCode, text: &str) -> Response {
    status_response(version, false, status, text)
}

/// Plain text reply for a request the connection no longer holds.
pub(crate) fn status_response(
    version: Version,
    keep_alive: bool,
    status: StatusCode,
    text: &str,
) -> Response {
    let mut res = http::Response::new(text.to_owned());
    *res.status_mut() = status;
    *res.version_mut() = version;
    prepare_head(res.headers_mut(), version, keep_alive, "text/plain");
    Response::Text(res)
}
