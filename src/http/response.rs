//! Response kinds accepted from handlers.
//!
//! # Design Decisions
//! - A closed enum instead of a boxed trait object; the writer matches on it
//! - The response head is a plain `http::Response`, so handlers use the
//!   `http` crate builders they already know
//! - Close semantics are decided from the head alone, before writing

use std::fmt;
use std::io;
use std::path::Path;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode, Version};
use tokio::fs::File;

use crate::http::request::{header_has_token, keep_alive};

/// Body chunks produced on demand.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// An open file together with the number of bytes to send from it.
pub struct FileBody {
    file: File,
    len: u64,
}

impl FileBody {
    /// Open a file and send it whole.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }

    /// Send the first `len` bytes of an already opened file.
    pub fn new(file: File, len: u64) -> Self {
        Self { file, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_parts(self) -> (File, u64) {
        (self.file, self.len)
    }
}

impl fmt::Debug for FileBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBody").field("len", &self.len).finish()
    }
}

/// A complete response, ready to be queued.
pub enum Response {
    /// In-memory text body, sent with `Content-Length`.
    Text(http::Response<String>),
    /// Body produced chunk by chunk.
    Stream(http::Response<ByteStream>),
    /// Body read from a file.
    File(http::Response<FileBody>),
    /// Head only.
    Empty(http::Response<()>),
}

impl Response {
    pub fn status(&self) -> StatusCode {
        match self {
            Response::Text(res) => res.status(),
            Response::Stream(res) => res.status(),
            Response::File(res) => res.status(),
            Response::Empty(res) => res.status(),
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Response::Text(res) => res.version(),
            Response::Stream(res) => res.version(),
            Response::File(res) => res.version(),
            Response::Empty(res) => res.version(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            Response::Text(res) => res.headers(),
            Response::Stream(res) => res.headers(),
            Response::File(res) => res.headers(),
            Response::Empty(res) => res.headers(),
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            Response::Text(res) => res.headers_mut(),
            Response::Stream(res) => res.headers_mut(),
            Response::File(res) => res.headers_mut(),
            Response::Empty(res) => res.headers_mut(),
        }
    }

    /// Whether the connection must be closed once this response is written.
    pub fn need_eof(&self) -> bool {
        if !keep_alive(self.headers(), self.version()) {
            return true;
        }
        // An HTTP/1.0 stream without a length can only be delimited by closing.
        matches!(self, Response::Stream(_))
            && self.version() < Version::HTTP_11
            && !self.headers().contains_key(CONTENT_LENGTH)
    }

    /// Mark the response as the last one on its connection.
    pub fn close(mut self) -> Self {
        self.headers_mut()
            .insert(CONNECTION, http::HeaderValue::from_static("close"));
        self
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Response::Text(_) => "text",
            Response::Stream(_) => "stream",
            Response::File(_) => "file",
            Response::Empty(_) => "empty",
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("version", &self.version())
            .field("close", &header_has_token(self.headers(), CONNECTION, "close"))
            .finish()
    }
}

impl From<http::Response<String>> for Response {
    fn from(res: http::Response<String>) -> Self {
        Response::Text(res)
    }
}

impl From<http::Response<ByteStream>> for Response {
    fn from(res: http::Response<ByteStream>) -> Self {
        Response::Stream(res)
    }
}

impl From<http::Response<FileBody>> for Response {
    fn from(res: http::Response<FileBody>) -> Self {
        Response::File(res)
    }
}

impl From<http::Response<()>> for Response {
    fn from(res: http::Response<()>) -> Self {
        Response::Empty(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use futures_util::StreamExt;

    fn text(version: Version, connection: Option<&str>) -> Response {
        let mut builder = http::Response::builder().version(version);
        if let Some(value) = connection {
            builder = builder.header(CONNECTION, value);
        }
        builder.body(String::from("hi")).unwrap().into()
    }

    #[test]
    fn need_eof_from_connection_semantics() {
        assert!(!text(Version::HTTP_11, None).need_eof());
        assert!(text(Version::HTTP_11, Some("close")).need_eof());
        assert!(text(Version::HTTP_10, None).need_eof());
        assert!(!text(Version::HTTP_10, Some("keep-alive")).need_eof());
    }

    #[test]
    fn unframed_http10_stream_needs_eof() {
        let body: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"x"))]).boxed();
        let res: Response = http::Response::builder()
            .version(Version::HTTP_10)
            .header(CONNECTION, "keep-alive")
            .body(body)
            .unwrap()
            .into();
        assert!(res.need_eof());
    }

    #[test]
    fn close_marks_response() {
        let res = text(Version::HTTP_11, None).close();
        assert!(res.need_eof());
        assert_eq!(res.kind(), "text");
    }
}
