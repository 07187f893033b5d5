//! Server side of the WebSocket opening handshake.

use bytes::BytesMut;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, SERVER, UPGRADE};
use http::{Method, StatusCode, Version};
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::error::SessionError;
use crate::http::codec;
use crate::http::responses::{error_response, SERVER_NAME};
use crate::http::Request;
use crate::net::Transport;
use crate::settings::SessionSettings;

/// Length of a base64 encoded 16-byte nonce.
const KEY_LEN: usize = 24;

/// Check the upgrade request and return its `Sec-WebSocket-Key`.
fn validate(request: &Request) -> Result<&[u8], &'static str> {
    if request.method() != Method::GET {
        return Err("upgrade requires GET");
    }
    if request.version() != Version::HTTP_11 {
        return Err("upgrade requires HTTP/1.1");
    }
    let version = request.headers().get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes());
    if version != Some(b"13".as_slice()) {
        return Err("unsupported Sec-WebSocket-Version");
    }
    match request.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) if key.as_bytes().len() == KEY_LEN => Ok(key.as_bytes()),
        _ => Err("missing or malformed Sec-WebSocket-Key"),
    }
}

/// Answer the upgrade and wrap the stream.
///
/// A rejected handshake is answered with `400 Bad Request` and the stream is
/// shut down; the message session never opens.
pub(super) async fn accept<S: Transport>(
    mut stream: S,
    buffered: BytesMut,
    request: &Request,
    settings: &SessionSettings,
) -> Result<WebSocketStream<S>, SessionError> {
    let key = match validate(request) {
        Ok(key) => key,
        Err(reason) => {
            tracing::debug!(reason, "Rejecting websocket handshake");
            let response = error_response(request.version(), StatusCode::BAD_REQUEST, reason);
            if let Err(e) = codec::write_response(&mut stream, response).await {
                tracing::debug!(error = %e, "Failed to write handshake rejection");
            }
            let _ = stream.shutdown().await;
            return Err(SessionError::Upgrade(reason));
        }
    };

    let response = http::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .version(Version::HTTP_11)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key))
        .header(SERVER, SERVER_NAME)
        .body(())
        .map_err(|_| SessionError::Upgrade("invalid handshake response"))?;
    codec::write_response(&mut stream, response.into())
        .await
        .map_err(SessionError::Write)?;

    Ok(WebSocketStream::from_partially_read(
        stream,
        buffered.to_vec(),
        Role::Server,
        Some(settings.websocket_config()),
    )
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn upgrade(version: Option<&str>, key: Option<&str>) -> Request {
        let mut builder = http::Request::builder()
            .uri("/chat")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket");
        if let Some(version) = version {
            builder = builder.header(SEC_WEBSOCKET_VERSION, version);
        }
        if let Some(key) = key {
            builder = builder.header(SEC_WEBSOCKET_KEY, key);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[test]
    fn accepts_valid_request() {
        let req = upgrade(Some("13"), Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(validate(&req).unwrap(), b"dGhlIHNhbXBsZSBub25jZQ==");
        // RFC 6455 section 1.3 example.
        assert_eq!(
            derive_accept_key(validate(&req).unwrap()),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn rejects_bad_requests() {
        assert!(validate(&upgrade(Some("8"), Some("dGhlIHNhbXBsZSBub25jZQ=="))).is_err());
        assert!(validate(&upgrade(Some("13"), None)).is_err());
        assert!(validate(&upgrade(Some("13"), Some("short"))).is_err());
    }

    #[tokio::test]
    async fn rejection_writes_400() {
        use tokio::io::AsyncReadExt;

        let (mut client, server) = tokio::io::duplex(4096);
        let req = upgrade(None, None);
        let result = accept(server, BytesMut::new(), &req, &SessionSettings::new()).await;
        assert!(matches!(result, Err(SessionError::Upgrade(_))));

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
