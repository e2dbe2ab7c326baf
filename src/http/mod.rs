//! HTTP/1.x request reconstruction and response framing.
//!
//! - [`parser`] rebuilds a [`Request`] line by line from arbitrary chunks.
//! - [`multipart`] streams `multipart/form-data` parts out of the body.
//! - [`upload`] stores streamed file parts on disk.
//! - [`response`] serializes a [`Response`] as HTTP or as a CGI reply.

use std::fmt;

pub mod headers;
pub mod multipart;
pub mod parser;
pub mod request;
pub mod response;
pub mod upload;

pub use headers::Headers;
pub use parser::{BodyFraming, ParseError, ParseState, ParserLimits, RequestParser};
pub use request::Request;
pub use response::Response;
pub use upload::{DiskSink, UploadError, UploadSink, UploadedFile};

/// Status codes the transport itself produces or commonly relays.
///
/// # Examples
///
/// ```
/// use wirefront::http::StatusCode;
///
/// assert_eq!(StatusCode::LengthRequired.as_u16(), 411);
/// assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    NoContent = 204,
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,
    BadRequest = 400,
    NotFound = 404,
    LengthRequired = 411,
    PayloadTooLarge = 413,
    InternalServerError = 500,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Reason phrase written after the numeric code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::LengthRequired => "Length Required",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
        }
    }

    /// Whether a response with this status may carry a body.
    pub fn allows_body(self) -> bool {
        !matches!(self, Self::NoContent | Self::NotModified)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// An HTTP request method.
///
/// # Examples
///
/// ```
/// use wirefront::http::Method;
///
/// let method: Method = "PATCH".parse().unwrap();
/// assert!(method.requires_length());
/// assert!(!Method::Get.requires_length());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
    /// Anything else; kept verbatim.
    Custom(String),
}

impl Method {
    /// The method token as sent on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Methods whose requests must declare `Content-Length`.
    pub fn requires_length(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(method) => method,
            Err(never) => match never {},
        }
    }
}
