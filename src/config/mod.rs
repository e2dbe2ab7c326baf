//! Server configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) is a
//! valid configuration:
//!
//! ```toml
//! listen = "127.0.0.1:9000"
//! mode = "fastcgi"
//! max_connections = 256
//! read_buffer_size = 16384
//! window_multiplier = 4
//! max_body_size = 8388608
//! max_params_size = 65536
//! upload_dir = "/var/tmp/wirefront"
//! idle_timeout_secs = 60
//! gzip_min_size = 128
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Wire protocol spoken on the listening socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plain HTTP/1.x from clients.
    #[default]
    Http,
    /// FastCGI records from a front-end server.
    FastCgi,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "fastcgi" | "fcgi" => Ok(Self::FastCgi),
            other => Err(ConfigError::Invalid(format!("unknown mode {other:?}"))),
        }
    }
}

/// Settings for [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub mode: Mode,
    /// Pool size; connections beyond this wait for a free slot.
    pub max_connections: usize,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Receive window capacity as a multiple of `read_buffer_size`.
    pub window_multiplier: usize,
    pub max_body_size: u64,
    /// Upper bound on the encoded FastCGI params of one request.
    pub max_params_size: usize,
    pub upload_dir: PathBuf,
    /// Seconds a connection may stay silent; `0` disables the timeout.
    pub idle_timeout_secs: u64,
    /// Smallest body worth compressing for clients that accept gzip.
    pub gzip_min_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9000)),
            mode: Mode::Http,
            max_connections: 256,
            read_buffer_size: 16 * 1024,
            window_multiplier: 4,
            max_body_size: 8 * 1024 * 1024,
            max_params_size: 64 * 1024,
            upload_dir: std::env::temp_dir().join("wirefront-uploads"),
            idle_timeout_secs: 60,
            gzip_min_size: 128,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Rejects settings that would make the server unusable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.read_buffer_size < 64 {
            return invalid("read_buffer_size must be at least 64 bytes");
        }
        if self.window_multiplier < 2 {
            // the window has to hold a read plus the undecided tail of the last one
            return invalid("window_multiplier must be at least 2");
        }
        if self.max_params_size == 0 {
            return invalid("max_params_size must be positive");
        }
        Ok(())
    }

    /// Capacity of each connection's receive windows.
    pub fn window_capacity(&self) -> usize {
        self.read_buffer_size.saturating_mul(self.window_multiplier)
    }

    /// `None` when idle connections are never timed out.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
