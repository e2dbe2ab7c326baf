//! The reconstructed HTTP request and its line-level parsing helpers.

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use super::{Headers, Method};
use super::upload::UploadedFile;

/// A request rebuilt by the [`RequestParser`](super::RequestParser).
///
/// Filled line by line while the head arrives, frozen at the blank line
/// that ends the headers, then completed by the body.
///
/// # Examples
///
/// ```
/// use wirefront::http::{BodyFraming, DiskSink, ParserLimits, RequestParser};
///
/// let mut parser = RequestParser::new(
///     4096,
///     BodyFraming::ContentLength,
///     ParserLimits::default(),
///     Box::new(DiskSink::new(std::env::temp_dir())),
/// );
/// parser.feed(b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
/// let request = parser.take_request().unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// ```
#[derive(Debug, Default)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) protocol: String,
    pub(crate) headers: Headers,
    pub(crate) query_params: Vec<(String, String)>,
    pub(crate) form_params: Vec<(String, String)>,
    pub(crate) uploads: Vec<UploadedFile>,
    pub(crate) body: Bytes,
    pub(crate) header_len: usize,
    pub(crate) content_length: Option<u64>,
}

impl Request {
    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Decoded path without the leading `/` (`/docs/a%20b` → `docs/a b`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Protocol token from the request line, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns all request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// First query parameter named `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        lookup(&self.query_params, name)
    }

    /// Decoded query parameters in order.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// First form field named `name`, from a urlencoded or multipart body.
    pub fn form_param(&self, name: &str) -> Option<&str> {
        lookup(&self.form_params, name)
    }

    /// Decoded form fields in order.
    pub fn form_params(&self) -> &[(String, String)] {
        &self.form_params
    }

    /// File parts stored while the body streamed in.
    pub fn uploads(&self) -> &[UploadedFile] {
        &self.uploads
    }

    /// Takes ownership of the stored files, e.g. to persist them.
    pub fn take_uploads(&mut self) -> Vec<UploadedFile> {
        std::mem::take(&mut self.uploads)
    }

    /// Buffered body for requests that are neither urlencoded nor multipart.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Bytes taken by the request line, headers and the blank line.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Declared `Content-Length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// HTTP/1.1 keeps the connection by default, HTTP/1.0 closes it; a
    /// `Connection` header overrides either.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.headers.has_token("connection", "keep-alive") {
            return true;
        }
        self.protocol.eq_ignore_ascii_case("HTTP/1.1")
    }

    /// Whether `Accept-Encoding` lists `gzip`.
    pub fn accepts_gzip(&self) -> bool {
        self.headers.has_token("accept-encoding", "gzip")
    }

    /// Requests issued by `XMLHttpRequest`.
    pub fn is_ajax(&self) -> bool {
        self.headers
            .get("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Pieces of a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub protocol: String,
}

/// Splits `METHOD SP RESOURCE SP PROTOCOL`.
///
/// A line without any space is taken as the resource of a GET; a missing
/// protocol means HTTP/1.0.
pub(crate) fn parse_request_line(line: &str) -> RequestLine {
    let line = line.trim();
    let (method, resource, protocol) = match line.split_once(' ') {
        None => (Method::Get, line, "HTTP/1.0"),
        Some((method, rest)) => {
            let rest = rest.trim_start();
            let (resource, protocol) = match rest.rsplit_once(' ') {
                Some((resource, protocol)) => (resource.trim_end(), protocol),
                None => (rest, "HTTP/1.0"),
            };
            (Method::from(method), resource, protocol)
        }
    };
    let (raw_path, query) = match resource.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (resource, None),
    };
    RequestLine {
        method,
        path: decode_path(raw_path),
        query,
        protocol: protocol.to_owned(),
    }
}

/// Percent-decodes a path once and drops the leading `/`. `+` stays a plus.
pub(crate) fn decode_path(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let decoded: &str = &decoded;
    decoded.strip_prefix('/').unwrap_or(decoded).to_owned()
}

/// Decodes `a=1&b=two+words` style data. Keys without `=` get an empty value.
pub(crate) fn parse_form(data: &str) -> Vec<(String, String)> {
    data.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_request_line() {
        let line = parse_request_line("POST /submit?x=1 HTTP/1.1");
        assert_eq!(line.method, Method::Post);
        assert_eq!(line.path, "submit");
        assert_eq!(line.query.as_deref(), Some("x=1"));
        assert_eq!(line.protocol, "HTTP/1.1");
    }

    #[test]
    fn line_without_space_is_a_get() {
        let line = parse_request_line("/legacy/page");
        assert_eq!(line.method, Method::Get);
        assert_eq!(line.path, "legacy/page");
        assert_eq!(line.protocol, "HTTP/1.0");
    }

    #[test]
    fn missing_protocol_defaults_to_http10() {
        let line = parse_request_line("GET /index");
        assert_eq!(line.path, "index");
        assert_eq!(line.protocol, "HTTP/1.0");
    }

    #[test]
    fn path_is_decoded_exactly_once() {
        // %2541 is "%41" after one pass; a second pass would yield "A"
        assert_eq!(decode_path("/a%2541"), "a%41");
        assert_eq!(decode_path("/hello%20world"), "hello world");
        assert_eq!(decode_path("/a+b"), "a+b");
    }

    #[test]
    fn query_split_happens_before_decoding() {
        let line = parse_request_line("GET /a%3Fb?c=d HTTP/1.1");
        assert_eq!(line.path, "a?b");
        assert_eq!(line.query.as_deref(), Some("c=d"));
    }

    #[test]
    fn form_decoding() {
        let pairs = parse_form("q=two+words&empty=&flag&pct=%41%26&&");
        assert_eq!(
            pairs,
            vec![
                ("q".to_owned(), "two words".to_owned()),
                ("empty".to_owned(), String::new()),
                ("flag".to_owned(), String::new()),
                ("pct".to_owned(), "A&".to_owned()),
            ]
        );
    }

    fn request_with(protocol: &str, headers: &[(&str, &str)]) -> Request {
        let mut request = Request {
            protocol: protocol.to_owned(),
            ..Request::default()
        };
        for (name, value) in headers {
            request.headers.insert(*name, *value);
        }
        request
    }

    #[test]
    fn keep_alive_defaults() {
        assert!(request_with("HTTP/1.1", &[]).is_keep_alive());
        assert!(!request_with("HTTP/1.0", &[]).is_keep_alive());
        assert!(request_with("HTTP/1.0", &[("Connection", "Keep-Alive")]).is_keep_alive());
        assert!(!request_with("HTTP/1.1", &[("Connection", "close")]).is_keep_alive());
    }

    #[test]
    fn gzip_and_ajax_detection() {
        let r = request_with(
            "HTTP/1.1",
            &[
                ("Accept-Encoding", "gzip, br"),
                ("X-Requested-With", "XMLHttpRequest"),
            ],
        );
        assert!(r.accepts_gzip());
        assert!(r.is_ajax());
        assert!(!request_with("HTTP/1.1", &[]).accepts_gzip());
    }
}
