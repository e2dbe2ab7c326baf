//! Response framing.
//!
//! A [`Response`] is produced by the application handler and serialized
//! either as an HTTP/1.1 message for direct clients or as a CGI-style reply
//! (`Status:` line, no protocol version) that the FastCGI layer wraps into
//! STDOUT records.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use super::{Headers, StatusCode};

/// A response ready to be framed.
///
/// # Examples
///
/// ```
/// use wirefront::http::{Response, StatusCode};
///
/// let bytes = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#)
///     .into_bytes();
///
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates an empty keep-alive response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// A plain-text response whose body is the reason phrase, used for
    /// transport-level rejections (400, 411, 413, ...).
    pub fn error(status: StatusCode) -> Self {
        Self::new(status)
            .body(status.canonical_reason())
            .keep_alive(false)
    }

    /// The reply for requests the handler does not serve.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NotFound).body(StatusCode::NotFound.canonical_reason())
    }

    /// Appends a header. Repeated names are kept.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets a binary body.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Asks for the connection to stay open (`true`, the default) or to be
    /// closed once this response is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Whether the connection may stay open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body as it will be written.
    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    /// Gzips the body when it is larger than `min_size` bytes and not
    /// already encoded. On encoder failure the body is sent as-is.
    #[must_use]
    pub fn gzip(mut self, min_size: usize) -> Self {
        if self.body.len() <= min_size || self.headers.contains("content-encoding") {
            return self;
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(self.body.len() / 2), Compression::fast());
        let compressed = encoder
            .write_all(&self.body)
            .and_then(|()| encoder.finish());
        match compressed {
            Ok(compressed) => {
                debug!(from = self.body.len(), to = compressed.len(), "gzipped response body");
                self.body = compressed;
                self.headers.set("Content-Encoding", "gzip");
                self.headers.set("Vary", "Accept-Encoding");
            }
            Err(e) => debug!(error = %e, "gzip failed, sending identity body"),
        }
        self
    }

    /// Serializes as an HTTP/1.1 message with `Content-Length` and
    /// `Connection` headers.
    pub fn into_bytes(self) -> BytesMut {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let status_line = format!("HTTP/1.1 {}\r\n", self.status);
        self.write(&status_line, Some(connection))
    }

    /// Serializes as a CGI reply: `Status: 200 OK`, headers, blank line,
    /// body. Connection management is left to the FastCGI layer.
    pub fn into_cgi_bytes(self) -> BytesMut {
        let status_line = format!("Status: {}\r\n", self.status);
        self.write(&status_line, None)
    }

    fn write(mut self, status_line: &str, connection: Option<&str>) -> BytesMut {
        if !self.status.allows_body() {
            self.body.clear();
        }
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", "text/plain; charset=utf-8");
        }
        if let Some(connection) = connection {
            self.headers.set("Connection", connection);
        }
        self.headers.set("Content-Length", self.body.len().to_string());

        let mut buf = BytesMut::with_capacity(64 + self.headers.len() * 48 + self.body.len());
        buf.put(status_line.as_bytes());
        buf.put(self.headers.to_string().as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_slice());
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
