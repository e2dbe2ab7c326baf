//! FastCGI record framing.
//!
//! Every record is an 8-byte header followed by `content_length` bytes of
//! content and `padding_length` bytes of padding:
//!
//! ```text
//! ┌─────────┬──────┬────────────┬────────────────┬─────────┬──────────┐
//! │ version │ type │ request id │ content length │ padding │ reserved │
//! │   u8    │  u8  │   u16 BE   │     u16 BE     │   u8    │    u8    │
//! └─────────┴──────┴────────────┴────────────────┴─────────┴──────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::{FastCgiError, nv};

/// The only protocol version defined.
pub const VERSION_1: u8 = 1;

/// Size of a record header.
pub const HEADER_LEN: usize = 8;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Request id reserved for management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// `BEGIN_REQUEST` flag asking the application to keep the connection open.
pub const KEEP_CONN: u8 = 1;

/// Management variable names answered in `GET_VALUES_RESULT`.
pub const MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const MAX_REQS: &str = "FCGI_MAX_REQS";
pub const MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

const BEGIN_REQUEST_BODY_LEN: usize = 8;
const END_REQUEST_BODY_LEN: usize = 8;
const UNKNOWN_TYPE_BODY_LEN: usize = 8;

/// Record type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Maps a wire value to a known type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Role requested in `BEGIN_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Other(u16),
}

impl From<u16> for Role {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::Responder,
            2 => Self::Authorizer,
            3 => Self::Filter,
            other => Self::Other(other),
        }
    }
}

impl From<Role> for u16 {
    fn from(role: Role) -> u16 {
        match role {
            Role::Responder => 1,
            Role::Authorizer => 2,
            Role::Filter => 3,
            Role::Other(v) => v,
        }
    }
}

/// Protocol-level outcome carried by `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnections,
    Overloaded,
    UnknownRole,
    Other(u8),
}

impl From<u8> for ProtocolStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::RequestComplete,
            1 => Self::CantMultiplexConnections,
            2 => Self::Overloaded,
            3 => Self::UnknownRole,
            other => Self::Other(other),
        }
    }
}

impl From<ProtocolStatus> for u8 {
    fn from(status: ProtocolStatus) -> u8 {
        match status {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMultiplexConnections => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
            ProtocolStatus::Other(v) => v,
        }
    }
}

/// A decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    /// Builds a version-1 header with padding that aligns the record to 8 bytes.
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type: record_type.as_u8(),
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    /// Decodes the header starting at `offset`.
    ///
    /// Returns the header and the offset just past it, or `None` if fewer
    /// than [`HEADER_LEN`] bytes are available.
    ///
    /// # Errors
    ///
    /// [`FastCgiError::UnsupportedVersion`] if the version byte is not 1.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Option<(Self, usize)>, FastCgiError> {
        let Some(raw) = buf.get(offset..offset + HEADER_LEN) else {
            return Ok(None);
        };
        if raw[0] != VERSION_1 {
            return Err(FastCgiError::UnsupportedVersion(raw[0]));
        }
        let header = Self {
            version: raw[0],
            record_type: raw[1],
            request_id: u16::from_be_bytes([raw[2], raw[3]]),
            content_length: u16::from_be_bytes([raw[4], raw[5]]),
            padding_length: raw[6],
        };
        Ok(Some((header, offset + HEADER_LEN)))
    }

    /// Appends the 8 header bytes.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.version);
        out.put_u8(self.record_type);
        out.put_u16(self.request_id);
        out.put_u16(self.content_length);
        out.put_u8(self.padding_length);
        out.put_u8(0);
    }

    /// The known record type, if any.
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Header, content and padding together.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }

    pub fn is_management(&self) -> bool {
        self.request_id == MANAGEMENT_REQUEST_ID
    }
}

/// Padding that brings `content_len` up to a multiple of 8.
pub fn padding_for(content_len: usize) -> u8 {
    ((8 - content_len % 8) % 8) as u8
}

/// Appends one record carrying `content`.
///
/// # Panics
///
/// Panics if `content` is longer than [`MAX_CONTENT_LEN`]; use
/// [`encode_stream`] for arbitrary lengths.
pub fn encode_record(record_type: RecordType, request_id: u16, content: &[u8], out: &mut BytesMut) {
    assert!(
        content.len() <= MAX_CONTENT_LEN,
        "record content of {} bytes exceeds {MAX_CONTENT_LEN}",
        content.len()
    );
    let header = RecordHeader::new(record_type, request_id, content.len() as u16);
    out.reserve(header.record_len());
    header.encode(out);
    out.put_slice(content);
    out.put_bytes(0, header.padding_length as usize);
}

/// Appends `content` as a sequence of records of at most [`MAX_CONTENT_LEN`]
/// bytes each. Empty content produces no record.
pub fn encode_stream(record_type: RecordType, request_id: u16, content: &[u8], out: &mut BytesMut) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        encode_record(record_type, request_id, chunk, out);
    }
}

/// A fully decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    BeginRequest {
        request_id: u16,
        role: Role,
        flags: u8,
    },
    AbortRequest {
        request_id: u16,
    },
    EndRequest {
        request_id: u16,
        app_status: i32,
        protocol_status: ProtocolStatus,
    },
    Params {
        request_id: u16,
        content: Bytes,
    },
    Stdin {
        request_id: u16,
        content: Bytes,
    },
    Stdout {
        request_id: u16,
        content: Bytes,
    },
    GetValues {
        names: Vec<String>,
    },
    GetValuesResult {
        values: Vec<(String, String)>,
    },
    UnknownType {
        record_type: u8,
    },
    /// STDERR, DATA and types this crate does not know.
    Other {
        header: RecordHeader,
        content: Bytes,
    },
}

impl Record {
    /// Decodes one complete record from the front of `buf`.
    ///
    /// Returns the record and the total bytes it occupied (padding
    /// included), or `None` if the record has not fully arrived.
    ///
    /// # Errors
    ///
    /// Version and body-shape errors from [`RecordHeader::decode`] and
    /// [`Record::from_parts`].
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FastCgiError> {
        let Some((header, body_start)) = RecordHeader::decode(buf, 0)? else {
            return Ok(None);
        };
        let total = header.record_len();
        if buf.len() < total {
            return Ok(None);
        }
        let content = &buf[body_start..body_start + header.content_length as usize];
        Ok(Some((Self::from_parts(&header, content)?, total)))
    }

    /// Builds the typed record for `header` from its complete content.
    ///
    /// # Errors
    ///
    /// [`FastCgiError::MalformedRecord`] if a fixed-size body is too short,
    /// [`FastCgiError::MalformedParams`] for a broken GET_VALUES body.
    pub fn from_parts(header: &RecordHeader, content: &[u8]) -> Result<Self, FastCgiError> {
        let request_id = header.request_id;
        let Some(kind) = header.kind() else {
            return Ok(Self::Other {
                header: *header,
                content: Bytes::copy_from_slice(content),
            });
        };
        let record = match kind {
            RecordType::BeginRequest => {
                let body = fixed_body(kind, content, BEGIN_REQUEST_BODY_LEN)?;
                Self::BeginRequest {
                    request_id,
                    role: Role::from(u16::from_be_bytes([body[0], body[1]])),
                    flags: body[2],
                }
            }
            RecordType::AbortRequest => Self::AbortRequest { request_id },
            RecordType::EndRequest => {
                let body = fixed_body(kind, content, END_REQUEST_BODY_LEN)?;
                Self::EndRequest {
                    request_id,
                    app_status: i32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    protocol_status: ProtocolStatus::from(body[4]),
                }
            }
            RecordType::Params => Self::Params {
                request_id,
                content: Bytes::copy_from_slice(content),
            },
            RecordType::Stdin => Self::Stdin {
                request_id,
                content: Bytes::copy_from_slice(content),
            },
            RecordType::Stdout => Self::Stdout {
                request_id,
                content: Bytes::copy_from_slice(content),
            },
            RecordType::GetValues => Self::GetValues {
                names: nv::decode_all(content)?
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect(),
            },
            RecordType::GetValuesResult => Self::GetValuesResult {
                values: nv::decode_all(content)?,
            },
            RecordType::UnknownType => {
                let body = fixed_body(kind, content, UNKNOWN_TYPE_BODY_LEN)?;
                Self::UnknownType {
                    record_type: body[0],
                }
            }
            RecordType::Stderr | RecordType::Data => Self::Other {
                header: *header,
                content: Bytes::copy_from_slice(content),
            },
        };
        Ok(record)
    }

    /// Request id the record belongs to; 0 for management records.
    pub fn request_id(&self) -> u16 {
        match self {
            Self::BeginRequest { request_id, .. }
            | Self::AbortRequest { request_id }
            | Self::EndRequest { request_id, .. }
            | Self::Params { request_id, .. }
            | Self::Stdin { request_id, .. }
            | Self::Stdout { request_id, .. } => *request_id,
            Self::GetValues { .. } | Self::GetValuesResult { .. } | Self::UnknownType { .. } => {
                MANAGEMENT_REQUEST_ID
            }
            Self::Other { header, .. } => header.request_id,
        }
    }

    /// Appends the wire form of this record.
    ///
    /// # Panics
    ///
    /// Panics if a stream record carries more than [`MAX_CONTENT_LEN`] bytes.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::BeginRequest {
                request_id,
                role,
                flags,
            } => {
                let mut body = [0u8; BEGIN_REQUEST_BODY_LEN];
                body[..2].copy_from_slice(&u16::from(*role).to_be_bytes());
                body[2] = *flags;
                encode_record(RecordType::BeginRequest, *request_id, &body, out);
            }
            Self::AbortRequest { request_id } => {
                encode_record(RecordType::AbortRequest, *request_id, &[], out);
            }
            Self::EndRequest {
                request_id,
                app_status,
                protocol_status,
            } => {
                let mut body = [0u8; END_REQUEST_BODY_LEN];
                body[..4].copy_from_slice(&app_status.to_be_bytes());
                body[4] = u8::from(*protocol_status);
                encode_record(RecordType::EndRequest, *request_id, &body, out);
            }
            Self::Params {
                request_id,
                content,
            } => encode_record(RecordType::Params, *request_id, content, out),
            Self::Stdin {
                request_id,
                content,
            } => encode_record(RecordType::Stdin, *request_id, content, out),
            Self::Stdout {
                request_id,
                content,
            } => encode_record(RecordType::Stdout, *request_id, content, out),
            Self::GetValues { names } => {
                let mut body = BytesMut::new();
                nv::encode_all(names.iter().map(|n| (n.as_str(), "")), &mut body);
                encode_record(RecordType::GetValues, MANAGEMENT_REQUEST_ID, &body, out);
            }
            Self::GetValuesResult { values } => {
                let mut body = BytesMut::new();
                nv::encode_all(values.iter().map(|(n, v)| (n.as_str(), v.as_str())), &mut body);
                encode_record(RecordType::GetValuesResult, MANAGEMENT_REQUEST_ID, &body, out);
            }
            Self::UnknownType { record_type } => {
                let mut body = [0u8; UNKNOWN_TYPE_BODY_LEN];
                body[0] = *record_type;
                encode_record(RecordType::UnknownType, MANAGEMENT_REQUEST_ID, &body, out);
            }
            Self::Other { header, content } => {
                let mut header = *header;
                header.content_length = content.len() as u16;
                header.padding_length = padding_for(content.len());
                header.encode(out);
                out.put_slice(content);
                out.put_bytes(0, header.padding_length as usize);
            }
        }
    }
}

fn fixed_body(kind: RecordType, content: &[u8], len: usize) -> Result<&[u8], FastCgiError> {
    content.get(..len).ok_or(FastCgiError::MalformedRecord {
        record_type: kind,
        reason: "body shorter than its fixed size",
    })
}
