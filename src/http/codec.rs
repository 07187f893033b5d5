//! HTTP/1.x wire format.
//!
//! # Responsibilities
//! - Decode one request at a time from a connection's read buffer
//! - Enforce header and body size limits while decoding
//! - Serialize each response kind onto the write half
//!
//! # Design Decisions
//! - The decoder remembers a parsed head while the body is still arriving,
//!   so a slow body never re-parses headers
//! - Chunked bodies are decoded as chunks complete; bytes already decoded
//!   are never scanned again
//! - Bytes after a decoded request stay in the buffer for the next read
//! - A response is written with `write_all` and flushed before the write
//!   counts as complete

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::http::request::{header_has_token, Request};
use crate::http::response::Response;

/// Header lines accepted in one request head.
const MAX_HEADERS: usize = 64;

/// Longest chunk-size line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked(ChunkedBody),
}

/// Progress through a chunked body. Complete chunks are moved out of the
/// read buffer as they arrive.
#[derive(Debug, Default)]
struct ChunkedBody {
    body: BytesMut,
    in_trailer: bool,
}

#[derive(Debug)]
struct PendingHead {
    parts: http::request::Parts,
    /// Head bytes still at the front of the read buffer.
    head_len: usize,
    framing: BodyFraming,
}

/// Incremental request decoder bound to one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    header_limit: usize,
    body_limit: u64,
    pending: Option<PendingHead>,
}

impl RequestDecoder {
    pub fn new(header_limit: usize, body_limit: u64) -> Self {
        Self {
            header_limit,
            body_limit,
            pending: None,
        }
    }

    /// Decode the next complete request from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On success the request's
    /// bytes are removed from `buf`; anything after it is left in place.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        if self.pending.is_none() {
            match self.parse_head(buf)? {
                Some(head) => self.pending = Some(head),
                None => return Ok(None),
            }
        }
        let body_limit = self.body_limit;
        let Some(head) = self.pending.as_mut() else {
            return Ok(None);
        };

        let body = match &mut head.framing {
            BodyFraming::Empty => {
                buf.advance(head.head_len);
                Bytes::new()
            }
            BodyFraming::Length(len) => {
                let len = *len;
                if buf.len() < head.head_len + len {
                    return Ok(None);
                }
                buf.advance(head.head_len);
                buf.split_to(len).freeze()
            }
            BodyFraming::Chunked(chunked) => {
                buf.advance(head.head_len);
                head.head_len = 0;
                if !chunked.decode(buf, body_limit)? {
                    return Ok(None);
                }
                chunked.body.split().freeze()
            }
        };

        match self.pending.take() {
            Some(head) => Ok(Some(Request::from_parts(head.parts, body))),
            None => Ok(None),
        }
    }

    fn parse_head(&self, buf: &[u8]) -> Result<Option<PendingHead>, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        let head_len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > self.header_limit {
                    return Err(ProtocolError::HeadTooLarge { limit: self.header_limit });
                }
                return Ok(None);
            }
        };
        if head_len > self.header_limit {
            return Err(ProtocolError::HeadTooLarge { limit: self.header_limit });
        }

        let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
            .map_err(|_| ProtocolError::Invalid("method"))?;
        let uri: Uri = parsed
            .path
            .unwrap_or_default()
            .parse()
            .map_err(|_| ProtocolError::Invalid("request target"))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| ProtocolError::Invalid("header name"))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| ProtocolError::Invalid("header value"))?;
            header_map.append(name, value);
        }

        let framing = self.body_framing(&header_map)?;

        let mut request = http::Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = header_map;
        let (parts, ()) = request.into_parts();

        Ok(Some(PendingHead {
            parts,
            head_len,
            framing,
        }))
    }

    fn body_framing(&self, headers: &HeaderMap) -> Result<BodyFraming, ProtocolError> {
        if headers.contains_key(TRANSFER_ENCODING) {
            if headers.contains_key(CONTENT_LENGTH) {
                return Err(ProtocolError::Invalid("content-length with transfer-encoding"));
            }
            // `chunked` is the only coding understood.
            let codings = headers
                .get_all(TRANSFER_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .filter(|coding| !coding.trim().is_empty())
                .count();
            return if codings == 1 && header_has_token(headers, TRANSFER_ENCODING, "chunked") {
                Ok(BodyFraming::Chunked(ChunkedBody::default()))
            } else {
                Err(ProtocolError::UnsupportedTransferEncoding)
            };
        }

        let mut length: Option<u64> = None;
        for value in headers.get_all(CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ProtocolError::Invalid("content-length"))?;
            if length.is_some_and(|previous| previous != parsed) {
                return Err(ProtocolError::Invalid("content-length"));
            }
            length = Some(parsed);
        }

        match length {
            None | Some(0) => Ok(BodyFraming::Empty),
            Some(len) if len > self.body_limit => Err(ProtocolError::BodyTooLarge { limit: self.body_limit }),
            Some(len) => usize::try_from(len)
                .map(BodyFraming::Length)
                .map_err(|_| ProtocolError::BodyTooLarge { limit: self.body_limit }),
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|window| window == b"\r\n")
}

impl ChunkedBody {
    /// Consume every complete chunk at the front of `buf`.
    ///
    /// Returns `true` once the last chunk and the trailer section have been
    /// read; a partial chunk stays in `buf` until the rest arrives.
    fn decode(&mut self, buf: &mut BytesMut, limit: u64) -> Result<bool, ProtocolError> {
        loop {
            let Some(line_len) = find_crlf(buf) else {
                if buf.len() > MAX_CHUNK_LINE {
                    return Err(ProtocolError::Invalid("chunk line"));
                }
                return Ok(false);
            };

            if self.in_trailer {
                // Trailer fields are skipped; an empty line ends the body.
                buf.advance(line_len + 2);
                if line_len == 0 {
                    return Ok(true);
                }
                continue;
            }

            let size_field = buf[..line_len].split(|b| *b == b';').next().unwrap_or_default();
            let size = std::str::from_utf8(size_field)
                .ok()
                .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                .ok_or(ProtocolError::Invalid("chunk size"))?;

            if size == 0 {
                buf.advance(line_len + 2);
                self.in_trailer = true;
                continue;
            }
            if (self.body.len() as u64).saturating_add(size as u64) > limit {
                return Err(ProtocolError::BodyTooLarge { limit });
            }

            let data_start = line_len + 2;
            let data_end = data_start + size;
            if buf.len() < data_end + 2 {
                return Ok(false);
            }
            if &buf[data_end..data_end + 2] != b"\r\n" {
                return Err(ProtocolError::Invalid("chunk terminator"));
            }
            buf.advance(data_start);
            self.body.extend_from_slice(&buf[..size]);
            buf.advance(size + 2);
        }
    }
}

enum Framing {
    Length(u64),
    Chunked,
    UntilClose,
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn encode_head(parts: &http::response::Parts, framing: &Framing) -> BytesMut {
    let mut head = BytesMut::with_capacity(256);
    let version = if parts.version < Version::HTTP_11 { "HTTP/1.0" } else { "HTTP/1.1" };
    head.extend_from_slice(version.as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(parts.status.as_str().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(parts.status.canonical_reason().unwrap_or("").as_bytes());
    head.extend_from_slice(b"\r\n");

    for (name, value) in parts.headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if status_allows_body(parts.status) {
        match framing {
            Framing::Length(len) if !parts.headers.contains_key(CONTENT_LENGTH) => {
                head.extend_from_slice(format!("content-length: {}\r\n", len).as_bytes());
            }
            Framing::Chunked if !parts.headers.contains_key(TRANSFER_ENCODING) => {
                head.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
            _ => {}
        }
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Write one response, returning the number of bytes put on the wire.
pub async fn write_response<W>(writer: &mut W, response: Response) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let written = match response {
        Response::Text(res) => {
            let (parts, body) = res.into_parts();
            let mut buf = encode_head(&parts, &Framing::Length(body.len() as u64));
            if status_allows_body(parts.status) {
                buf.extend_from_slice(body.as_bytes());
            }
            writer.write_all(&buf).await?;
            buf.len() as u64
        }
        Response::Empty(res) => {
            let (parts, ()) = res.into_parts();
            let head = encode_head(&parts, &Framing::Length(0));
            writer.write_all(&head).await?;
            head.len() as u64
        }
        Response::File(res) => {
            let (parts, body) = res.into_parts();
            let (file, len) = body.into_parts();
            let head = encode_head(&parts, &Framing::Length(len));
            writer.write_all(&head).await?;
            let mut copied = 0;
            if status_allows_body(parts.status) {
                let mut limited = tokio::io::AsyncReadExt::take(file, len);
                copied = tokio::io::copy(&mut limited, writer).await?;
                if copied < len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shorter than its announced length",
                    ));
                }
            }
            head.len() as u64 + copied
        }
        Response::Stream(res) => {
            let (parts, mut body) = res.into_parts();
            let framing = if let Some(len) = parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
            {
                Framing::Length(len)
            } else if parts.version >= Version::HTTP_11 {
                Framing::Chunked
            } else {
                Framing::UntilClose
            };
            let head = encode_head(&parts, &framing);
            writer.write_all(&head).await?;
            let mut total = head.len() as u64;

            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                if let Framing::Chunked = framing {
                    let size_line = format!("{:x}\r\n", chunk.len());
                    writer.write_all(size_line.as_bytes()).await?;
                    writer.write_all(&chunk).await?;
                    writer.write_all(b"\r\n").await?;
                    total += (size_line.len() + chunk.len() + 2) as u64;
                } else {
                    writer.write_all(&chunk).await?;
                    total += chunk.len() as u64;
                }
            }
            if let Framing::Chunked = framing {
                writer.write_all(b"0\r\n\r\n").await?;
                total += 5;
            }
            total
        }
    };
    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::ByteStream;
    use futures_util::stream;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(8 * 1024, 1024)
    }

    #[test]
    fn decodes_pipelined_requests_one_at_a_time() {
        let mut buf = BytesMut::from(
            &b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /c"[..],
        );
        let mut decoder = decoder();

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.uri().path(), "/a");
        assert_eq!(first.headers()["host"], "x");
        assert!(first.body().is_empty());

        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.method(), Method::POST);
        assert_eq!(second.body().as_ref(), b"abc");

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"GET /c");
    }

    #[test]
    fn waits_for_body() {
        let mut buf = BytesMut::from(&b"PUT /x HTTP/1.0\r\nContent-Length: 4\r\n\r\nab"[..]);
        let mut decoder = decoder();
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cd");
        let req = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.version(), Version::HTTP_10);
        assert_eq!(req.body().as_ref(), b"abcd");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_chunked_body() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\nX-Trailer: 1\r\n\r\nnext"[..],
        );
        let mut decoder = decoder();
        let req = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.body().as_ref(), b"abcde");
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn partial_chunked_body_needs_more() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nab"[..]);
        assert!(decoder().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn chunked_body_is_consumed_as_chunks_complete() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n4\r\nde"[..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        // Head and the first chunk are gone; only the partial chunk is left.
        assert_eq!(&buf[..], b"4\r\nde");

        buf.extend_from_slice(b"fg\r\n0\r\n");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"X-Trailer: 1\r\n\r\nGET /next HTTP/1.1\r\n\r\n");
        let req = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.body().as_ref(), b"abcdefg");

        let next = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.uri().path(), "/next");
        assert!(next.body().is_empty());
    }

    #[test]
    fn chunked_limit_counts_earlier_chunks() {
        let mut decoder = RequestDecoder::new(8 * 1024, 8);
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nabcde\r\n"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"5\r\n");
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::BodyTooLarge { limit: 8 })
        ));
    }

    #[test]
    fn rejects_oversized_bodies() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n"[..]);
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::BodyTooLarge { limit: 1024 }));

        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n800\r\n"[..]);
        let err = decoder().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::BodyTooLarge { .. }));
    }

    #[test]
    fn rejects_oversized_heads() {
        let mut decoder = RequestDecoder::new(32, 1024);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::HeadTooLarge { limit: 32 })
        ));
    }

    #[test]
    fn rejects_malformed_requests() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nBad Header\r\n\r\n"[..]);
        assert!(matches!(decoder().decode(&mut buf), Err(ProtocolError::Malformed(_))));

        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"[..]);
        assert!(matches!(decoder().decode(&mut buf), Err(ProtocolError::Invalid(_))));

        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"[..]);
        assert!(matches!(
            decoder().decode(&mut buf),
            Err(ProtocolError::UnsupportedTransferEncoding)
        ));
    }

    #[tokio::test]
    async fn writes_text_with_length() {
        let res: Response = http::Response::builder()
            .status(StatusCode::OK)
            .header("x-test", "1")
            .body(String::from("hello"))
            .unwrap()
            .into();
        let mut out = Vec::new();
        let written = write_response(&mut out, res).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(written as usize, text.len());
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-test: 1\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn writes_stream_chunked() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"cde")),
        ])
        .boxed();
        let res: Response = http::Response::new(body).into();
        let mut out = Vec::new();
        write_response(&mut out, res).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn writes_empty_bodies() {
        let res: Response = http::Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(())
            .unwrap()
            .into();
        let mut out = Vec::new();
        write_response(&mut out, res).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "HTTP/1.1 204 No Content\r\n\r\n");

        let res: Response = http::Response::new(()).into();
        let mut out = Vec::new();
        write_response(&mut out, res).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"
        );
    }
}
