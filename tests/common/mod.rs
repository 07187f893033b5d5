//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use web_session::{ConnectionSession, Request, Responder, SessionError, SessionSettings};

/// Run a connection session over an in-memory stream.
pub fn spawn_session(settings: SessionSettings) -> (DuplexStream, JoinHandle<Result<(), SessionError>>) {
    let (client, server) = duplex(64 * 1024);
    let task = tokio::spawn(ConnectionSession::new(server, Arc::new(settings)).run());
    (client, task)
}

/// Settings whose handler forwards every request and responder to the test.
pub fn collecting_settings() -> (SessionSettings, mpsc::UnboundedReceiver<(Request, Responder)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settings = SessionSettings::new().on_http_request(move |req, responder, _| {
        let _ = tx.send((req, responder));
    });
    (settings, rx)
}

pub fn get(path: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path)
}

/// Text response with the path as body.
pub fn echo_path(req: &Request) -> web_session::Response {
    web_session::http::responses::string_response(
        req,
        req.uri().path(),
        http::StatusCode::OK,
        "text/plain",
    )
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Reads `Content-Length` framed responses off a client stream.
pub struct ResponseReader<'a> {
    stream: &'a mut DuplexStream,
    buf: BytesMut,
}

impl<'a> ResponseReader<'a> {
    pub fn new(stream: &'a mut DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    pub async fn write(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Next response, or `None` once the server has closed the stream.
    pub async fn next(&mut self) -> Option<RawResponse> {
        tokio::time::timeout(Duration::from_secs(5), self.next_inner())
            .await
            .expect("timed out waiting for a response")
    }

    async fn next_inner(&mut self) -> Option<RawResponse> {
        loop {
            if let Some(response) = self.try_parse() {
                return Some(response);
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            if n == 0 {
                assert!(self.buf.is_empty(), "stream closed mid-response");
                return None;
            }
        }
    }

    fn try_parse(&mut self) -> Option<RawResponse> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(&self.buf).unwrap() {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return None,
        };
        let status = parsed.code.unwrap();
        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        let len: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);
        if self.buf.len() < head_len + len {
            return None;
        }
        self.buf.advance(head_len);
        let body = self.buf.split_to(len).to_vec();
        Some(RawResponse { status, headers, body })
    }
}
