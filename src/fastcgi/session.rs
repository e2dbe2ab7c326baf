//! Per-connection FastCGI session.
//!
//! [`Session`] is sans-I/O: the connection driver hands it whatever bytes
//! the socket produced and gets back [`SessionEvent`]s. Record headers may
//! straddle reads, so the session keeps a small [`ReceiveWindow`] for them;
//! STDIN content is forwarded as soon as it arrives rather than waiting for
//! the whole record.
//!
//! ```text
//!  Idle ─BEGIN─▶ BeginReceived ─PARAMS─▶ ParamsAccumulating ─PARAMS(0)─▶ ParamsDone
//!                                                                          │ STDIN
//!                            Complete ◀─STDIN(0)── StdinStreaming ◀────────┘
//!        (any state) ─ABORT─▶ Aborted
//! ```
//!
//! On the first STDIN record the session emits a synthetic HTTP request head
//! built from the CGI params, so the HTTP parser downstream never needs to
//! know it is behind FastCGI.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::record::{
    self, MAX_CONNS, MAX_REQS, MPXS_CONNS, ProtocolStatus, Record, RecordHeader, RecordType, Role,
};
use super::{FastCgiError, nv};
use crate::buffer::ReceiveWindow;

/// Where a connection is in the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    BeginReceived,
    ParamsAccumulating,
    ParamsDone,
    StdinStreaming,
    Complete,
    Aborted,
}

/// Output of [`Session::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes for the HTTP parser: first the synthesized head, then body bytes.
    Http(Bytes),
    /// The STDIN stream ended; the request body is complete.
    EndOfRequest,
    /// The front end aborted the request; the connection must close.
    Aborted,
    /// Records to write back immediately (management answers, role refusals).
    Reply(Bytes),
}

/// State of the request currently being received.
#[derive(Debug, Clone)]
pub struct RequestSession {
    pub request_id: u16,
    pub role: Role,
    pub keep_alive: bool,
    pub end_of_stdin: bool,
    pub aborted: bool,
    params: Vec<(String, String)>,
}

impl RequestSession {
    fn new(request_id: u16, role: Role, flags: u8) -> Self {
        Self {
            request_id,
            role,
            keep_alive: flags & record::KEEP_CONN != 0,
            end_of_stdin: false,
            aborted: false,
            params: Vec::new(),
        }
    }

    /// Value of a CGI param.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All params in arrival order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    // Later values replace earlier ones but keep their position.
    fn merge_param(&mut self, name: String, value: String) {
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
    }
}

/// Bounds applied by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Upper bound for the whole PARAMS stream of one request.
    pub max_params_size: usize,
    /// Advertised as FCGI_MAX_CONNS and FCGI_MAX_REQS.
    pub max_conns: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_params_size: 64 * 1024,
            max_conns: 128,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Header,
    Content {
        header: RecordHeader,
        remaining: usize,
    },
    Padding(usize),
}

/// FastCGI to HTTP translator for one connection.
#[derive(Debug)]
pub struct Session {
    window: ReceiveWindow,
    cursor: Cursor,
    content: BytesMut,
    params_buf: BytesMut,
    params_total: usize,
    state: SessionState,
    request: Option<RequestSession>,
    limits: SessionLimits,
}

impl Session {
    /// Creates a session whose header window holds `window_capacity` bytes.
    pub fn new(window_capacity: usize, limits: SessionLimits) -> Self {
        Self {
            window: ReceiveWindow::with_capacity(window_capacity.max(2 * record::HEADER_LEN)),
            cursor: Cursor::Header,
            content: BytesMut::with_capacity(64),
            params_buf: BytesMut::new(),
            params_total: 0,
            state: SessionState::Idle,
            request: None,
            limits,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The request being received, if any.
    pub fn request(&self) -> Option<&RequestSession> {
        self.request.as_ref()
    }

    /// Whether the front end asked to keep the connection open.
    pub fn keep_conn(&self) -> bool {
        self.request.as_ref().is_some_and(|r| r.keep_alive)
    }

    /// Feeds raw socket bytes through the record decoder.
    ///
    /// # Errors
    ///
    /// Any [`FastCgiError`]; all of them are fatal for the connection.
    pub fn process(&mut self, mut data: &[u8]) -> Result<Vec<SessionEvent>, FastCgiError> {
        let mut events = Vec::new();
        loop {
            // After drain() at most HEADER_LEN - 1 bytes stay pending, so
            // there is always room for more.
            let n = data.len().min(self.window.free());
            self.window.append(&data[..n])?;
            data = &data[n..];
            self.drain(&mut events)?;
            if data.is_empty() {
                return Ok(events);
            }
        }
    }

    /// Wraps `body` into STDOUT records plus END_REQUEST for the active
    /// request and returns the session to `Idle`.
    ///
    /// Returns whether the front end asked to keep the connection open.
    ///
    /// # Errors
    ///
    /// [`FastCgiError::NoActiveRequest`] if no request was started.
    pub fn respond(
        &mut self,
        body: &[u8],
        app_status: i32,
        out: &mut BytesMut,
    ) -> Result<bool, FastCgiError> {
        let request = self.request.take().ok_or(FastCgiError::NoActiveRequest)?;
        encode_response(
            request.request_id,
            body,
            app_status,
            ProtocolStatus::RequestComplete,
            out,
        );
        debug!(request_id = request.request_id, bytes = body.len(), "FastCGI response framed");
        self.state = SessionState::Idle;
        self.params_buf.clear();
        self.params_total = 0;
        Ok(request.keep_alive)
    }

    /// Forgets everything, keeping allocations for the next connection.
    pub fn reset(&mut self) {
        self.window.reset();
        self.cursor = Cursor::Header;
        self.content.clear();
        self.params_buf.clear();
        self.params_total = 0;
        self.state = SessionState::Idle;
        self.request = None;
    }

    fn drain(&mut self, events: &mut Vec<SessionEvent>) -> Result<(), FastCgiError> {
        loop {
            match self.cursor {
                Cursor::Header => {
                    let Some((header, used)) = RecordHeader::decode(self.window.pending(), 0)?
                    else {
                        return Ok(());
                    };
                    self.window.consume(used, 0);
                    trace!(
                        record_type = header.record_type,
                        request_id = header.request_id,
                        content_length = header.content_length,
                        "record header"
                    );
                    self.begin_record(&header, events)?;
                    self.cursor = Cursor::Content {
                        header,
                        remaining: header.content_length as usize,
                    };
                }
                Cursor::Content { header, remaining } if remaining > 0 => {
                    if self.window.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.window.len());
                    let chunk = Bytes::copy_from_slice(self.window.consume(take, 0));
                    self.cursor = Cursor::Content {
                        header,
                        remaining: remaining - take,
                    };
                    self.record_content(&header, chunk, events)?;
                }
                Cursor::Content { header, .. } => {
                    self.cursor = match header.padding_length {
                        0 => Cursor::Header,
                        pad => Cursor::Padding(pad as usize),
                    };
                    self.end_record(&header, events)?;
                }
                Cursor::Padding(remaining) => {
                    if self.window.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.window.len());
                    self.window.consume(take, 0);
                    self.cursor = match remaining - take {
                        0 => Cursor::Header,
                        left => Cursor::Padding(left),
                    };
                }
            }
        }
    }

    fn begin_record(
        &mut self,
        header: &RecordHeader,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), FastCgiError> {
        self.content.clear();
        if header.is_management() {
            return Ok(());
        }
        match header.kind() {
            Some(RecordType::BeginRequest) => {
                if let Some(active) = &self.request {
                    return Err(FastCgiError::Multiplexing {
                        active: active.request_id,
                        incoming: header.request_id,
                    });
                }
            }
            Some(RecordType::AbortRequest) => {}
            Some(RecordType::Params) => {
                self.check_request(header)?;
                if !matches!(
                    self.state,
                    SessionState::BeginReceived | SessionState::ParamsAccumulating
                ) {
                    return Err(self.unexpected(header));
                }
                if header.content_length > 0 {
                    self.state = SessionState::ParamsAccumulating;
                }
            }
            Some(RecordType::Stdin) => {
                self.check_request(header)?;
                match self.state {
                    SessionState::ParamsDone => {
                        if let Some(request) = &self.request {
                            events.push(SessionEvent::Http(synthesize_head(request)));
                        }
                        self.state = SessionState::StdinStreaming;
                    }
                    SessionState::StdinStreaming => {}
                    _ => return Err(self.unexpected(header)),
                }
            }
            _ => return Err(self.unexpected(header)),
        }
        Ok(())
    }

    fn record_content(
        &mut self,
        header: &RecordHeader,
        chunk: Bytes,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), FastCgiError> {
        if header.is_management() {
            self.content.extend_from_slice(&chunk);
            return Ok(());
        }
        match header.kind() {
            Some(RecordType::Stdin) => events.push(SessionEvent::Http(chunk)),
            Some(RecordType::Params) => {
                self.params_total += chunk.len();
                if self.params_total > self.limits.max_params_size {
                    return Err(FastCgiError::ParamsTooLarge {
                        max: self.limits.max_params_size,
                    });
                }
                self.params_buf.extend_from_slice(&chunk);
                self.merge_complete_params();
            }
            _ => self.content.extend_from_slice(&chunk),
        }
        Ok(())
    }

    fn end_record(
        &mut self,
        header: &RecordHeader,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), FastCgiError> {
        if header.is_management() {
            events.push(SessionEvent::Reply(self.management_reply(header)?));
            return Ok(());
        }
        match header.kind() {
            Some(RecordType::BeginRequest) => {
                let Record::BeginRequest {
                    request_id,
                    role,
                    flags,
                } = Record::from_parts(header, &self.content)?
                else {
                    return Ok(());
                };
                if role != Role::Responder {
                    debug!(request_id, ?role, "refusing unsupported role");
                    let mut reply = BytesMut::new();
                    encode_end_request(request_id, 0, ProtocolStatus::UnknownRole, &mut reply);
                    events.push(SessionEvent::Reply(reply.freeze()));
                    return Ok(());
                }
                debug!(request_id, keep_conn = flags & record::KEEP_CONN != 0, "FastCGI request started");
                self.request = Some(RequestSession::new(request_id, role, flags));
                self.state = SessionState::BeginReceived;
            }
            Some(RecordType::AbortRequest) => match &mut self.request {
                Some(request) if request.request_id == header.request_id => {
                    debug!(request_id = header.request_id, "FastCGI request aborted");
                    request.aborted = true;
                    self.state = SessionState::Aborted;
                    events.push(SessionEvent::Aborted);
                }
                _ => debug!(request_id = header.request_id, "abort for unknown request ignored"),
            },
            Some(RecordType::Params) if header.content_length == 0 => {
                if !self.params_buf.is_empty() {
                    return Err(FastCgiError::MalformedParams);
                }
                self.state = SessionState::ParamsDone;
            }
            Some(RecordType::Stdin) if header.content_length == 0 => {
                if let Some(request) = &mut self.request {
                    request.end_of_stdin = true;
                }
                self.state = SessionState::Complete;
                events.push(SessionEvent::EndOfRequest);
            }
            _ => {}
        }
        Ok(())
    }

    fn management_reply(&self, header: &RecordHeader) -> Result<Bytes, FastCgiError> {
        let reply = match header.kind() {
            Some(RecordType::GetValues) => {
                let Record::GetValues { names } = Record::from_parts(header, &self.content)? else {
                    return Err(FastCgiError::MalformedParams);
                };
                let values = names
                    .into_iter()
                    .filter_map(|name| {
                        let value = match name.as_str() {
                            MAX_CONNS | MAX_REQS => self.limits.max_conns.to_string(),
                            MPXS_CONNS => "0".to_owned(),
                            _ => return None,
                        };
                        Some((name, value))
                    })
                    .collect();
                Record::GetValuesResult { values }
            }
            _ => Record::UnknownType {
                record_type: header.record_type,
            },
        };
        let mut out = BytesMut::new();
        reply.encode(&mut out);
        Ok(out.freeze())
    }

    fn merge_complete_params(&mut self) {
        let mut pairs = Vec::new();
        let mut offset = 0;
        while let Some(((name, value), used)) = nv::read_pair(&self.params_buf[offset..]) {
            pairs.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
            offset += used;
        }
        self.params_buf.advance(offset);
        if let Some(request) = &mut self.request {
            for (name, value) in pairs {
                request.merge_param(name, value);
            }
        }
    }

    fn check_request(&self, header: &RecordHeader) -> Result<(), FastCgiError> {
        match &self.request {
            None => Err(self.unexpected(header)),
            Some(r) if r.request_id != header.request_id => Err(FastCgiError::RequestIdMismatch {
                expected: r.request_id,
                got: header.request_id,
            }),
            Some(_) => Ok(()),
        }
    }

    fn unexpected(&self, header: &RecordHeader) -> FastCgiError {
        FastCgiError::UnexpectedRecord {
            record_type: header.record_type,
            state: self.state,
        }
    }
}

/// Frames a response body as STDOUT records followed by END_REQUEST.
///
/// Each STDOUT record carries at most 65535 bytes; an empty body produces
/// only the END_REQUEST record.
pub fn encode_response(
    request_id: u16,
    body: &[u8],
    app_status: i32,
    protocol_status: ProtocolStatus,
    out: &mut BytesMut,
) {
    out.reserve(body.len() + (body.len() / record::MAX_CONTENT_LEN + 2) * 16);
    record::encode_stream(RecordType::Stdout, request_id, body, out);
    encode_end_request(request_id, app_status, protocol_status, out);
}

/// Appends a lone END_REQUEST record.
pub fn encode_end_request(
    request_id: u16,
    app_status: i32,
    protocol_status: ProtocolStatus,
    out: &mut BytesMut,
) {
    Record::EndRequest {
        request_id,
        app_status,
        protocol_status,
    }
    .encode(out);
}

/// Builds `METHOD URI PROTOCOL\r\n` plus headers from the CGI params.
fn synthesize_head(request: &RequestSession) -> Bytes {
    let param = |name| request.param(name).filter(|v| !v.is_empty());
    let mut head = BytesMut::with_capacity(512);

    head.put_slice(param("REQUEST_METHOD").unwrap_or("GET").as_bytes());
    head.put_u8(b' ');
    match param("REQUEST_URI") {
        Some(uri) => head.put_slice(uri.as_bytes()),
        None => {
            let script = param("DOCUMENT_URI")
                .or_else(|| param("SCRIPT_NAME"))
                .unwrap_or("/");
            head.put_slice(script.as_bytes());
            if let Some(query) = param("QUERY_STRING") {
                head.put_u8(b'?');
                head.put_slice(query.as_bytes());
            }
        }
    }
    head.put_u8(b' ');
    head.put_slice(param("SERVER_PROTOCOL").unwrap_or("HTTP/1.1").as_bytes());
    head.put_slice(b"\r\n");

    let mut written: Vec<String> = Vec::new();
    for (name, value) in request.params() {
        let header = match name.strip_prefix("HTTP_") {
            Some(rest) => header_name(rest),
            None if matches!(name, "CONTENT_TYPE" | "CONTENT_LENGTH") && !value.is_empty() => {
                header_name(name)
            }
            None => continue,
        };
        if written.iter().any(|w| w.eq_ignore_ascii_case(&header)) {
            continue;
        }
        put_header(&mut head, &header, value);
        written.push(header);
    }
    if !written.iter().any(|w| w.eq_ignore_ascii_case("host")) {
        if let Some(server) = param("SERVER_NAME") {
            put_header(&mut head, "Host", server);
        }
    }
    head.put_slice(b"\r\n");
    head.freeze()
}

fn put_header(head: &mut BytesMut, name: &str, value: &str) {
    head.put_slice(name.as_bytes());
    head.put_slice(b": ");
    head.put_slice(value.as_bytes());
    head.put_slice(b"\r\n");
}

/// `ACCEPT_ENCODING` → `Accept-Encoding`.
fn header_name(cgi: &str) -> String {
    cgi.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
