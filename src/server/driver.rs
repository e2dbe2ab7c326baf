//! Per-connection driver.
//!
//! One task owns one [`ConnectionSlot`] and runs a strict loop: read a chunk,
//! push it through the FastCGI session (FastCGI mode) and the HTTP parser,
//! hand every completed request to the handler, write the answer, and only
//! then read again. A connection's bytes are therefore never processed out of
//! order or concurrently with themselves, and at most one write is in flight.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;
use tokio::time;
use tracing::{debug, trace, warn};

use super::Handler;
use super::pool::ConnectionSlot;
use crate::config::{Mode, ServerConfig};
use crate::error::ErrorKind;
use crate::fastcgi::session::encode_end_request;
use crate::fastcgi::{FastCgiError, ProtocolStatus, SessionEvent};
use crate::http::{ParseError, Request, Response};

/// Why a connection ended abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    FastCgi(#[from] FastCgiError),
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Transport,
            Self::Parse(e) => e.kind(),
            Self::FastCgi(e) => e.kind(),
        }
    }
}

impl ConnectionSlot {
    /// Serves the attached socket until the peer leaves, a response asks to
    /// close, the idle timeout fires or a fatal error occurs.
    pub async fn serve<H: Handler>(
        &mut self,
        handler: &H,
        config: &ServerConfig,
    ) -> Result<(), ConnectionError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let mut buf = std::mem::take(&mut self.read_buf);
        let result = self.pump(&mut stream, &mut buf, handler, config).await;
        self.read_buf = buf;
        let _ = stream.shutdown().await;
        result
    }

    async fn pump<H: Handler>(
        &mut self,
        stream: &mut TcpStream,
        buf: &mut [u8],
        handler: &H,
        config: &ServerConfig,
    ) -> Result<(), ConnectionError> {
        while !self.should_close {
            let n = match config.idle_timeout() {
                Some(limit) => match time::timeout(limit, stream.read(buf)).await {
                    Ok(read) => read?,
                    Err(_) => {
                        debug!(timeout = ?limit, "idle connection closed");
                        return Ok(());
                    }
                },
                None => stream.read(buf).await?,
            };
            if n == 0 {
                if self.parser.is_idle() {
                    debug!("connection closed by peer");
                } else {
                    debug!(state = ?self.parser.state(), "peer closed mid-request");
                }
                return Ok(());
            }
            trace!(bytes = n, "received");

            match config.mode {
                Mode::Http => self.on_http(&buf[..n], stream, handler, config).await?,
                Mode::FastCgi => self.on_fastcgi(&buf[..n], stream, handler, config).await?,
            }
            self.flush(stream).await?;
        }
        Ok(())
    }

    async fn on_http<H: Handler>(
        &mut self,
        mut data: &[u8],
        stream: &mut TcpStream,
        handler: &H,
        config: &ServerConfig,
    ) -> Result<(), ConnectionError> {
        while !data.is_empty() && !self.should_close {
            let used = match blocking(|| self.parser.feed(data)) {
                Ok(used) => used,
                Err(e) => return self.reject(e, config),
            };
            data = &data[used..];
            if let Some(request) = self.parser.take_request() {
                self.dispatch(request, stream, handler, config).await?;
            }
        }
        Ok(())
    }

    async fn on_fastcgi<H: Handler>(
        &mut self,
        data: &[u8],
        stream: &mut TcpStream,
        handler: &H,
        config: &ServerConfig,
    ) -> Result<(), ConnectionError> {
        let events = match self.session.process(data) {
            Ok(events) => events,
            Err(FastCgiError::Multiplexing { active, incoming }) => {
                warn!(active, incoming, "refusing multiplexed request");
                encode_end_request(
                    incoming,
                    0,
                    ProtocolStatus::CantMultiplexConnections,
                    &mut self.send_buf,
                );
                self.should_close = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for event in events {
            if self.should_close {
                break;
            }
            match event {
                SessionEvent::Http(bytes) => {
                    if let Err(e) = blocking(|| self.parser.feed(&bytes)) {
                        return self.reject(e, config);
                    }
                }
                SessionEvent::EndOfRequest => {
                    if let Err(e) = blocking(|| self.parser.end_of_stream()) {
                        return self.reject(e, config);
                    }
                    if let Some(request) = self.parser.take_request() {
                        self.dispatch(request, stream, handler, config).await?;
                    }
                }
                SessionEvent::Aborted => {
                    debug!("request aborted by front end");
                    self.parser.reset();
                    self.should_close = true;
                }
                SessionEvent::Reply(bytes) => self.send_buf.extend_from_slice(&bytes),
            }
        }
        Ok(())
    }

    async fn dispatch<H: Handler>(
        &mut self,
        request: Request,
        stream: &mut TcpStream,
        handler: &H,
        config: &ServerConfig,
    ) -> Result<(), ConnectionError> {
        let wants_keep_alive = match config.mode {
            Mode::Http => request.is_keep_alive(),
            Mode::FastCgi => self.session.keep_conn(),
        };
        let gzip = request.accepts_gzip() && !request.is_ajax();
        debug!(method = %request.method(), path = %request.path(), "dispatching request");

        let response = handler
            .call(request)
            .await
            .unwrap_or_else(Response::not_found);
        let response = if gzip {
            response.gzip(config.gzip_min_size)
        } else {
            response
        };
        let keep_alive = wants_keep_alive && response.is_keep_alive();
        debug!(status = %response.status(), keep_alive, "response ready");

        match config.mode {
            Mode::Http => {
                let bytes = response.keep_alive(keep_alive).into_bytes();
                self.send_buf.extend_from_slice(&bytes);
            }
            Mode::FastCgi => {
                let reply = response.into_cgi_bytes();
                self.session.respond(&reply, 0, &mut self.send_buf)?;
            }
        }
        self.flush(stream).await?;
        if !keep_alive {
            self.should_close = true;
        }
        Ok(())
    }

    /// Answers a validation failure with its status and marks the connection
    /// for closing. Anything else is handed back as fatal.
    fn reject(&mut self, error: ParseError, config: &ServerConfig) -> Result<(), ConnectionError> {
        let status = match error.status() {
            Some(status) if !error.kind().is_fatal() => status,
            _ => return Err(error.into()),
        };
        warn!(error = %error, %status, "rejecting request");
        self.parser.reset();
        let response = Response::error(status);
        match config.mode {
            Mode::Http => self.send_buf.extend_from_slice(&response.into_bytes()),
            Mode::FastCgi => {
                if self.session.request().is_some() {
                    let reply = response.into_cgi_bytes();
                    self.session.respond(&reply, 0, &mut self.send_buf)?;
                }
            }
        }
        self.should_close = true;
        Ok(())
    }

    async fn flush(&mut self, stream: &mut TcpStream) -> Result<(), ConnectionError> {
        if !self.send_buf.is_empty() {
            stream.write_all(&self.send_buf).await?;
            trace!(bytes = self.send_buf.len(), "sent");
            self.send_buf.clear();
        }
        Ok(())
    }
}

/// Runs parser work that may write upload parts to disk. On a multi-threaded
/// runtime the worker is handed off first so other connections keep running.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(f)
        }
        _ => f(),
    }
}
