//! # wirefront
//!
//! The transport layer under a web application: a pooled async server that
//! rebuilds HTTP/1.x requests from raw TCP bytes, optionally unwrapped from
//! FastCGI records sent by a front end such as nginx, and streams multipart
//! uploads to disk instead of memory.
//!
//! - [`buffer`]: the sliding receive window every parser reads from.
//! - [`fastcgi`]: record codec and the FastCGI-to-HTTP session translator.
//! - [`http`]: incremental request parser, multipart reader, responses.
//! - [`server`]: connection pool, per-connection driver and accept loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wirefront::config::{Mode, ServerConfig};
//! use wirefront::http::{Request, Response, StatusCode};
//! use wirefront::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         mode: Mode::FastCgi,
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config).await?;
//!     server
//!         .run(|req: Request| async move {
//!             (req.path() == "hello").then(|| Response::new(StatusCode::Ok).body("Hello, World!"))
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod fastcgi;
pub mod http;
pub mod server;

pub use config::{Mode, ServerConfig};
pub use error::ErrorKind;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Handler, Server, ServerError};
