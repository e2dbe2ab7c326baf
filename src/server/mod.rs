//! Pooled async TCP server.
//!
//! The accept loop first takes a [`ConnectionSlot`](pool::ConnectionSlot)
//! from the [`ConnectionPool`], then accepts one socket and spawns a task that
//! drives it. When the pool is empty, accepting stops until a connection
//! ends and its slot is returned.

use std::future::{self, Future};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time;
use tracing::{Instrument, debug, debug_span, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::error::ErrorKind;
use crate::http::{Request, Response};

pub mod driver;
pub mod pool;

pub use driver::ConnectionError;
pub use pool::{ConnectionPool, ConnectionSlot, PooledSlot};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Application entry point for completed requests.
///
/// Any `Fn(Request) -> impl Future<Output = R>` with `R` either [`Response`]
/// or `Option<Response>` implements this trait; `None` is answered with
/// 404 Not Found.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> Pin<Box<dyn Future<Output = Option<Response>> + Send>>;
}

impl<T, F, R> Handler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = R> + Send + 'static,
    R: Into<Option<Response>>,
{
    fn call(&self, request: Request) -> Pin<Box<dyn Future<Output = Option<Response>> + Send>> {
        let fut = (self)(request);
        Box::pin(async move {
            let response: Option<Response> = fut.await.into();
            response
        })
    }
}

/// The wirefront server.
///
/// # Examples
///
/// ```rust,no_run
/// use wirefront::config::ServerConfig;
/// use wirefront::http::{Request, Response, StatusCode};
/// use wirefront::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind(ServerConfig::default()).await?;
///     server
///         .run(|req: Request| async move {
///             Response::new(StatusCode::Ok).body(format!("hello {}", req.path()))
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    pool: Arc<ConnectionPool>,
}

impl Server {
    /// Validates `config`, binds its listen address and allocates the pool.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for invalid settings, [`ServerError::Bind`]
    /// if the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let pool = ConnectionPool::new(&config);
        Ok(Self {
            listener,
            local_addr,
            config: Arc::new(config),
            pool,
        })
    }

    /// The address actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Serves until the process ends.
    ///
    /// # Errors
    ///
    /// Currently never; accept failures are logged and retried.
    pub async fn run(self, handler: impl Handler) -> Result<(), ServerError> {
        self.run_until(handler, future::pending()).await
    }

    /// Serves until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    ///
    /// # Errors
    ///
    /// Currently never; accept failures are logged and retried.
    pub async fn run_until(
        self,
        handler: impl Handler,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);
        info!(
            address = %self.local_addr,
            mode = ?self.config.mode,
            max_connections = self.pool.capacity(),
            "wirefront listening"
        );

        let mut accept_failures = 0u32;
        loop {
            let slot = tokio::select! {
                () = &mut shutdown => break,
                slot = self.pool.acquire() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let pause = accept_backoff(accept_failures);
                        error!(error = %e, retry_in = ?pause, "failed to accept connection");
                        time::sleep(pause).await;
                        continue;
                    }
                },
            };
            accept_failures = 0;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let span = debug_span!("connection", peer = %peer, slot = slot.id());
            let handler = Arc::clone(&handler);
            let config = Arc::clone(&self.config);
            tokio::spawn(
                async move {
                    let mut slot = slot;
                    slot.attach(stream);
                    debug!("connection accepted");
                    match slot.serve(handler.as_ref(), &config).await {
                        Ok(()) => debug!("connection finished"),
                        Err(e) if e.kind() == ErrorKind::Transport => {
                            debug!(error = %e, "connection dropped");
                        }
                        Err(e) => warn!(error = %e, kind = %e.kind(), "connection closed with error"),
                    }
                }
                .instrument(span),
            );
        }

        info!("no longer accepting connections");
        Ok(())
    }
}

/// Pause after the `failures`-th accept error in a row: 10ms doubling up to
/// one second. Running out of file descriptors would otherwise spin.
fn accept_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << exp).min(Duration::from_secs(1))
}
