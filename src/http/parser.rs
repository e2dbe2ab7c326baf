//! Incremental, line-oriented HTTP/1.x request parser.
//!
//! Bytes are pushed in whatever chunks the socket (or the FastCGI layer)
//! produces; the parser keeps the undecided tail in its [`ReceiveWindow`]
//! and picks up where it left off on the next [`feed`](RequestParser::feed).
//!
//! ```text
//! AwaitingRequestLine → ReadingHeaders → HeadersDone ─┬→ ReadingUrlEncodedBody ─┐
//!                                                     ├→ ReadingMultipart ──────┼→ Complete
//!                                                     └→ ReadingRawBody ────────┘
//! ```
//!
//! A body ends either when `header_len + Content-Length` bytes have been
//! received ([`BodyFraming::ContentLength`]) or when the caller signals
//! [`end_of_stream`](RequestParser::end_of_stream) ([`BodyFraming::EndOfStream`],
//! used behind FastCGI where the STDIN stream end is authoritative).

use bytes::BytesMut;
use thiserror::Error;
use tracing::trace;

use super::StatusCode;
use super::multipart::{self, MultipartReader};
use super::request::{Request, RequestLine, parse_form, parse_request_line};
use super::upload::{UploadError, UploadSink};
use crate::buffer::{BufferError, ReceiveWindow};
use crate::error::ErrorKind;

const CRLF: &[u8] = b"\r\n";

/// Errors produced while parsing a request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("request method requires a Content-Length")]
    LengthRequired,

    #[error("missing Host header")]
    MissingHost,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("multipart content type without a boundary")]
    MissingBoundary,

    #[error("request body exceeds {max} bytes")]
    BodyTooLarge { max: u64 },

    #[error("malformed multipart body: {0}")]
    Multipart(&'static str),

    #[error("stream ended before the request was complete")]
    Incomplete,

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl ParseError {
    /// Classifies the error for the driver.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Buffer(_) | Self::Multipart(_) | Self::Incomplete => ErrorKind::Framing,
            Self::Upload(_) => ErrorKind::Transport,
            Self::MalformedHeader(_)
            | Self::LengthRequired
            | Self::MissingHost
            | Self::InvalidContentLength(_)
            | Self::MissingBoundary
            | Self::BodyTooLarge { .. } => ErrorKind::Validation,
        }
    }

    /// The status to answer with, for errors the client can be told about.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::LengthRequired => Some(StatusCode::LengthRequired),
            Self::BodyTooLarge { .. } => Some(StatusCode::PayloadTooLarge),
            Self::MalformedHeader(_)
            | Self::MissingHost
            | Self::InvalidContentLength(_)
            | Self::MissingBoundary => Some(StatusCode::BadRequest),
            _ => None,
        }
    }
}

/// Where the parser is inside the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingRequestLine,
    ReadingHeaders,
    /// The blank line was seen and the head validated; the body kind is
    /// chosen next.
    HeadersDone,
    ReadingUrlEncodedBody,
    ReadingMultipart,
    /// Any other body; buffered as-is.
    ReadingRawBody,
    Complete,
}

/// How the end of a body is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// By byte count from `Content-Length`. Bytes past the body are left to
    /// the caller (pipelining).
    ContentLength,
    /// By an explicit [`RequestParser::end_of_stream`] call.
    EndOfStream,
}

/// Size limits enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Largest accepted body, uploads included.
    pub max_body_size: u64,
    /// Largest plain multipart field kept in memory.
    pub max_field_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_body_size: 8 * 1024 * 1024,
            max_field_size: 64 * 1024,
        }
    }
}

/// Rebuilds [`Request`]s from arbitrarily split input.
pub struct RequestParser {
    window: ReceiveWindow,
    state: ParseState,
    framing: BodyFraming,
    limits: ParserLimits,
    sink: Box<dyn UploadSink>,
    request: Request,
    body: BytesMut,
    multipart: Option<MultipartReader>,
    give_back: usize,
}

impl std::fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParser")
            .field("state", &self.state)
            .field("framing", &self.framing)
            .field("pending", &self.window.len())
            .finish_non_exhaustive()
    }
}

impl RequestParser {
    /// Creates a parser whose window holds at most `window_capacity` undecided
    /// bytes; a header line longer than that is a framing error.
    pub fn new(
        window_capacity: usize,
        framing: BodyFraming,
        limits: ParserLimits,
        sink: Box<dyn UploadSink>,
    ) -> Self {
        Self {
            window: ReceiveWindow::with_capacity(window_capacity),
            state: ParseState::AwaitingRequestLine,
            framing,
            limits,
            sink,
            request: Request::default(),
            body: BytesMut::new(),
            multipart: None,
            give_back: 0,
        }
    }

    /// Returns the current parse state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Whether a request is ready for [`take_request`](Self::take_request).
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Whether no byte of a new request has been seen yet.
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::AwaitingRequestLine && self.window.received() == 0
    }

    /// Pushes `data` through the state machine.
    ///
    /// Returns how many bytes were taken. Fewer than `data.len()` means the
    /// request completed and the rest belongs to the next one: take the
    /// request, then feed the remainder again.
    ///
    /// # Errors
    ///
    /// Any [`ParseError`]; the parser must be [`reset`](Self::reset) before reuse.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;
        while consumed < data.len() && self.state != ParseState::Complete {
            let mut take = (data.len() - consumed).min(self.window.free());
            if let Some(left) = self.body_left() {
                take = take.min(usize::try_from(left).unwrap_or(usize::MAX));
            }
            if take == 0 {
                // full window and nothing decidable in it
                return Err(BufferError::Overflow {
                    pending: self.window.len(),
                    incoming: data.len() - consumed,
                    capacity: self.window.capacity(),
                }
                .into());
            }
            self.window.append(&data[consumed..consumed + take])?;
            consumed += take;
            self.advance()?;
            consumed -= std::mem::take(&mut self.give_back);
        }
        Ok(consumed)
    }

    /// Signals that no more bytes will arrive for this request.
    ///
    /// With [`BodyFraming::EndOfStream`] this completes the request. With
    /// [`BodyFraming::ContentLength`] it only succeeds if the request was
    /// already complete.
    ///
    /// # Errors
    ///
    /// [`ParseError::Incomplete`] if the request line, or a counted body, is
    /// unfinished. A head without its blank line is validated as it stands.
    pub fn end_of_stream(&mut self) -> Result<(), ParseError> {
        if self.state == ParseState::Complete {
            return Ok(());
        }
        if self.framing == BodyFraming::ContentLength {
            return Err(ParseError::Incomplete);
        }
        // the end of input also ends a head still missing its blank line
        if self.state == ParseState::ReadingHeaders {
            self.finish_head()?;
        }
        self.advance()?;
        match self.state {
            ParseState::ReadingUrlEncodedBody
            | ParseState::ReadingMultipart
            | ParseState::ReadingRawBody => self.finalize(),
            ParseState::Complete => Ok(()),
            _ => Err(ParseError::Incomplete),
        }
    }

    /// Hands out the completed request and prepares for the next one.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state != ParseState::Complete {
            return None;
        }
        let request = std::mem::take(&mut self.request);
        self.clear();
        Some(request)
    }

    /// Drops the request in progress, including any half-stored upload.
    pub fn reset(&mut self) {
        self.sink.abort();
        self.request = Request::default();
        self.clear();
    }

    fn clear(&mut self) {
        self.window.reset();
        self.state = ParseState::AwaitingRequestLine;
        self.body.clear();
        self.multipart = None;
        self.give_back = 0;
    }

    /// Body bytes still expected under counted framing.
    fn body_left(&self) -> Option<u64> {
        let in_body = matches!(
            self.state,
            ParseState::ReadingUrlEncodedBody
                | ParseState::ReadingMultipart
                | ParseState::ReadingRawBody
        );
        if self.framing != BodyFraming::ContentLength || !in_body {
            return None;
        }
        Some(self.body_end().saturating_sub(self.window.received()))
    }

    fn body_end(&self) -> u64 {
        self.request.header_len as u64 + self.request.content_length.unwrap_or(0)
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::AwaitingRequestLine => {
                    let Some(pos) = self.window.find(CRLF) else {
                        return Ok(());
                    };
                    let line = self.window.consume_line(pos, CRLF.len());
                    if line.trim().is_empty() {
                        continue;
                    }
                    let RequestLine {
                        method,
                        path,
                        query,
                        protocol,
                    } = parse_request_line(&line);
                    trace!(%method, %path, "request line");
                    if let Some(query) = &query {
                        self.request.query_params = parse_form(query);
                    }
                    self.request.method = method;
                    self.request.path = path;
                    self.request.query = query;
                    self.request.protocol = protocol;
                    self.state = ParseState::ReadingHeaders;
                }
                ParseState::ReadingHeaders => {
                    let Some(pos) = self.window.find(CRLF) else {
                        return Ok(());
                    };
                    let line = self.window.consume_line(pos, CRLF.len());
                    if line.trim().is_empty() {
                        if !self.request.headers.is_empty() {
                            self.finish_head()?;
                        }
                        continue;
                    }
                    let Some((name, value)) = line.split_once(':') else {
                        return Err(ParseError::MalformedHeader(line));
                    };
                    self.request.headers.insert(name.trim(), value.trim());
                }
                ParseState::HeadersDone => self.choose_body()?,
                ParseState::ReadingUrlEncodedBody | ParseState::ReadingRawBody => {
                    let n = self.window.len();
                    if self.body.len() + n > self.max_body_len() {
                        return Err(ParseError::BodyTooLarge {
                            max: self.limits.max_body_size,
                        });
                    }
                    self.body.extend_from_slice(self.window.consume(n, 0));
                    return self.complete_if_counted();
                }
                ParseState::ReadingMultipart => {
                    let seen = self.window.received() - self.request.header_len as u64;
                    if seen > self.limits.max_body_size {
                        return Err(ParseError::BodyTooLarge {
                            max: self.limits.max_body_size,
                        });
                    }
                    if let Some(reader) = self.multipart.as_mut() {
                        reader.advance(&mut self.window, self.sink.as_mut(), &mut self.request)?;
                    }
                    return self.complete_if_counted();
                }
                ParseState::Complete => return Ok(()),
            }
        }
    }

    fn max_body_len(&self) -> usize {
        usize::try_from(self.limits.max_body_size).unwrap_or(usize::MAX)
    }

    /// Validates the head once the blank line has been read.
    fn finish_head(&mut self) -> Result<(), ParseError> {
        let pending = self.window.len() as u64;
        self.request.header_len = usize::try_from(self.window.received() - pending)
            .unwrap_or(usize::MAX);

        let content_length = match self.request.headers.get("content-length") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::InvalidContentLength(raw.to_owned()))?,
            ),
            None => None,
        };
        if content_length.is_none() && self.request.method.requires_length() {
            return Err(ParseError::LengthRequired);
        }
        if !self.request.headers.contains("host") {
            return Err(ParseError::MissingHost);
        }
        if content_length.is_some_and(|len| len > self.limits.max_body_size) {
            return Err(ParseError::BodyTooLarge {
                max: self.limits.max_body_size,
            });
        }
        self.request.content_length = content_length;

        if self.framing == BodyFraming::ContentLength {
            let body = content_length.unwrap_or(0);
            if pending > body {
                let excess = (pending - body) as usize;
                self.window.truncate(self.window.len() - excess);
                self.give_back += excess;
            }
        }
        self.state = ParseState::HeadersDone;
        Ok(())
    }

    fn choose_body(&mut self) -> Result<(), ParseError> {
        let content_type = self.request.header("content-type").unwrap_or("");
        let boundary = multipart::boundary_of(content_type);
        let urlencoded = content_type
            .split(';')
            .next()
            .is_some_and(|media| {
                media
                    .trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            });

        self.state = match boundary {
            Some(boundary) if boundary.is_empty() => return Err(ParseError::MissingBoundary),
            Some(boundary) => {
                self.multipart = Some(MultipartReader::new(
                    &boundary,
                    self.limits.max_field_size,
                ));
                ParseState::ReadingMultipart
            }
            None if urlencoded => ParseState::ReadingUrlEncodedBody,
            None => ParseState::ReadingRawBody,
        };
        Ok(())
    }

    fn complete_if_counted(&mut self) -> Result<(), ParseError> {
        if self.framing == BodyFraming::ContentLength
            && self.window.received() >= self.body_end()
        {
            self.finalize()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ParseError> {
        match self.state {
            ParseState::ReadingUrlEncodedBody => {
                let body = self.body.split();
                self.request.form_params = parse_form(&String::from_utf8_lossy(&body));
            }
            ParseState::ReadingRawBody => {
                self.request.body = self.body.split().freeze();
            }
            ParseState::ReadingMultipart => {
                if let Some(mut reader) = self.multipart.take() {
                    reader.advance(&mut self.window, self.sink.as_mut(), &mut self.request)?;
                    reader.finish(&mut self.window)?;
                }
            }
            _ => {}
        }
        trace!(
            header_len = self.request.header_len,
            forms = self.request.form_params.len(),
            uploads = self.request.uploads.len(),
            "request complete"
        );
        self.state = ParseState::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::http::upload::{DiskSink, tests::scratch_dir};

    fn parser(framing: BodyFraming) -> RequestParser {
        RequestParser::new(
            1024,
            framing,
            ParserLimits::default(),
            Box::new(DiskSink::new(scratch_dir("parser"))),
        )
    }

    fn parse_whole(input: &[u8]) -> Result<Request, ParseError> {
        let mut p = parser(BodyFraming::ContentLength);
        p.feed(input)?;
        Ok(p.take_request().expect("request should be complete"))
    }

    #[test]
    fn simple_get_with_query() {
        let request = parse_whole(b"GET /page?x=1 HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(request.method(), &Method::Get);
        assert_eq!(request.path(), "page");
        assert_eq!(request.query_param("x"), Some("1"));
        assert_eq!(request.protocol(), "HTTP/1.1");
        assert_eq!(request.header("HOST"), Some("a"));
        assert_eq!(request.header_len(), 35);
    }

    #[test]
    fn any_split_produces_the_same_request() {
        let input: &[u8] =
            b"POST /form HTTP/1.1\r\nHost: h\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 19\r\n\r\nname=Ann+B&tag=%41z";
        for split in 1..input.len() {
            let mut p = parser(BodyFraming::ContentLength);
            assert_eq!(p.feed(&input[..split]).unwrap(), split);
            assert!(!p.is_complete() || split == input.len());
            assert_eq!(p.feed(&input[split..]).unwrap(), input.len() - split);
            let request = p.take_request().unwrap();
            assert_eq!(request.form_param("name"), Some("Ann B"), "split {split}");
            assert_eq!(request.form_param("tag"), Some("Az"), "split {split}");
            assert_eq!(request.content_length(), Some(19));
        }
    }

    #[test]
    fn post_without_length_is_rejected() {
        let err = parse_whole(b"POST /x HTTP/1.1\r\nHost: a\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::LengthRequired));
        assert_eq!(err.status(), Some(StatusCode::LengthRequired));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn missing_host_is_bad_request() {
        let err = parse_whole(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingHost));
        assert_eq!(err.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn invalid_content_length() {
        let err =
            parse_whole(b"PUT /x HTTP/1.1\r\nHost: a\r\nContent-Length: ten\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength(ref v) if v == "ten"));
    }

    #[test]
    fn header_without_colon() {
        let err = parse_whole(b"GET / HTTP/1.1\r\nbogus\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedHeader(_)));
    }

    #[test]
    fn oversized_declared_body() {
        let mut p = RequestParser::new(
            256,
            BodyFraming::ContentLength,
            ParserLimits {
                max_body_size: 10,
                max_field_size: 10,
            },
            Box::new(DiskSink::new(scratch_dir("parser"))),
        );
        let err = p
            .feed(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::PayloadTooLarge));
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let request = parse_whole(b"\r\n\r\nGET /a HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(request.path(), "a");
    }

    #[test]
    fn raw_body_is_buffered() {
        let request = parse_whole(
            b"PUT /doc HTTP/1.1\r\nHost: a\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        )
        .unwrap();
        assert_eq!(request.body().as_ref(), b"{\"a\":1}");
        assert!(request.form_params().is_empty());
    }

    #[test]
    fn pipelined_requests_are_split() {
        let input: &[u8] = b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nPOST /two HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabcGET /three HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut p = parser(BodyFraming::ContentLength);
        let mut rest = input;
        let mut paths = Vec::new();
        while !rest.is_empty() {
            let used = p.feed(rest).unwrap();
            rest = &rest[used..];
            let request = p.take_request().unwrap();
            paths.push(request.path().to_owned());
        }
        assert_eq!(paths, ["one", "two", "three"]);
        assert!(p.is_idle());
    }

    #[test]
    fn line_longer_than_window_overflows() {
        let mut p = RequestParser::new(
            16,
            BodyFraming::ContentLength,
            ParserLimits::default(),
            Box::new(DiskSink::new(scratch_dir("parser"))),
        );
        let err = p.feed(b"GET /a-very-long-path-indeed HTTP/1.1\r\n").unwrap_err();
        assert!(matches!(err, ParseError::Buffer(_)));
        assert!(err.kind().is_fatal());
    }

    #[test]
    fn end_of_stream_completes_uncounted_body() {
        let mut p = parser(BodyFraming::EndOfStream);
        p.feed(b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 999\r\n\r\npart one ")
            .unwrap();
        p.feed(b"part two").unwrap();
        assert!(!p.is_complete());
        p.end_of_stream().unwrap();
        let request = p.take_request().unwrap();
        assert_eq!(request.body().as_ref(), b"part one part two");
    }

    #[test]
    fn end_of_stream_mid_request_line_is_incomplete() {
        let mut p = parser(BodyFraming::EndOfStream);
        p.feed(b"GET / HT").unwrap();
        assert!(matches!(p.end_of_stream(), Err(ParseError::Incomplete)));
    }

    #[test]
    fn end_of_stream_ends_an_unterminated_head() {
        let mut p = parser(BodyFraming::EndOfStream);
        p.feed(b"GET /a HTTP/1.1\r\nHost: a\r\n").unwrap();
        p.end_of_stream().unwrap();
        assert_eq!(p.take_request().unwrap().path(), "a");
    }

    #[test]
    fn head_without_headers_is_validated() {
        let mut p = parser(BodyFraming::EndOfStream);
        p.feed(b"GET /foo HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(p.state(), ParseState::ReadingHeaders);
        let err = p.end_of_stream().unwrap_err();
        assert!(matches!(err, ParseError::MissingHost));
        assert_eq!(err.status(), Some(StatusCode::BadRequest));
    }

    #[test]
    fn counted_framing_ignores_early_end_of_stream() {
        let mut p = parser(BodyFraming::ContentLength);
        p.feed(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nab")
            .unwrap();
        assert!(matches!(p.end_of_stream(), Err(ParseError::Incomplete)));
    }

    #[test]
    fn multipart_upload_through_parser() {
        let dir = scratch_dir("parser-mp");
        let body: &[u8] = b"--B\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\r\n0123456789\r\n--B--\r\n";
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let input = [head.as_bytes(), body].concat();

        for chunk in [1, 7, 64, input.len()] {
            let mut p = RequestParser::new(
                128,
                BodyFraming::ContentLength,
                ParserLimits::default(),
                Box::new(DiskSink::new(&dir)),
            );
            for piece in input.chunks(chunk) {
                assert_eq!(p.feed(piece).unwrap(), piece.len());
            }
            let request = p.take_request().unwrap();
            assert_eq!(request.form_param("note"), Some("hi"), "chunk {chunk}");
            assert_eq!(request.uploads().len(), 1);
            assert_eq!(
                std::fs::read(request.uploads()[0].path()).unwrap(),
                b"0123456789"
            );
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn multipart_without_boundary() {
        let err = parse_whole(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::MissingBoundary));
    }

    #[test]
    fn reset_allows_reuse_after_error() {
        let mut p = parser(BodyFraming::ContentLength);
        assert!(p.feed(b"POST / HTTP/1.1\r\nHost: a\r\n\r\n").is_err());
        p.reset();
        p.feed(b"GET /ok HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(p.take_request().unwrap().path(), "ok");
    }
}
