//! Request type and header inspection helpers.
//!
//! # Responsibilities
//! - Define the request type handed to handlers (head + fully read body)
//! - Detect WebSocket upgrade requests
//! - Derive keep-alive semantics from version and `Connection` tokens

use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderName, Method, Version};

/// An HTTP request with its body fully read.
pub type Request = http::Request<Bytes>;

/// Whether any value of a comma separated header contains `token`.
pub(crate) fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Extension methods for [`Request`].
pub trait RequestExt {
    /// A GET asking to switch the connection to the WebSocket protocol.
    fn is_websocket_upgrade(&self) -> bool;

    /// Whether the client expects the connection to stay open.
    fn keep_alive(&self) -> bool;
}

impl<B> RequestExt for http::Request<B> {
    fn is_websocket_upgrade(&self) -> bool {
        self.method() == Method::GET
            && self.version() >= Version::HTTP_11
            && header_has_token(self.headers(), CONNECTION, "upgrade")
            && header_has_token(self.headers(), UPGRADE, "websocket")
    }

    fn keep_alive(&self) -> bool {
        keep_alive(self.headers(), self.version())
    }
}

pub(crate) fn keep_alive(headers: &HeaderMap, version: Version) -> bool {
    if header_has_token(headers, CONNECTION, "close") {
        return false;
    }
    if header_has_token(headers, CONNECTION, "keep-alive") {
        return true;
    }
    version >= Version::HTTP_11
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().method(Method::GET).uri("/ws").version(version);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[test]
    fn detects_websocket_upgrade() {
        let req = request(
            Version::HTTP_11,
            &[("connection", "keep-alive, Upgrade"), ("upgrade", "WebSocket")],
        );
        assert!(req.is_websocket_upgrade());

        let req = request(Version::HTTP_11, &[("upgrade", "websocket")]);
        assert!(!req.is_websocket_upgrade());

        let req = request(Version::HTTP_10, &[("connection", "upgrade"), ("upgrade", "websocket")]);
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn keep_alive_follows_version_and_tokens() {
        assert!(request(Version::HTTP_11, &[]).keep_alive());
        assert!(!request(Version::HTTP_11, &[("connection", "close")]).keep_alive());
        assert!(!request(Version::HTTP_10, &[]).keep_alive());
        assert!(request(Version::HTTP_10, &[("connection", "Keep-Alive")]).keep_alive());
    }
}
