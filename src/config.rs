//! Server configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults
//! 2. `mxserver.toml` (or the file given with `-c`)
//! 3. environment variables prefixed with `RUST_MX_`
//! 4. command-line flags (applied by the binary)
//!
//! Nested keys are separated by a double underscore in the environment, so
//! `RUST_MX_SERVER__MAX_SOCKETS=200` sets `server.max_sockets`.
//!
//! # Example
//! ```no_run
//! use rust_mx::config::ServerConfig;
//!
//! let config = ServerConfig::load(None)?;
//! config.validate()?;
//! println!("port: {}", config.server.port);
//! # Ok::<(), rust_mx::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use mx_server::{DataFormat, ServerOptions, DEFAULT_MAX_SOCKETS, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mxserver.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_MX_";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or did not match the expected shape.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The merged configuration is not usable. Carries every problem found.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub server: ServerSection,
    /// Log output.
    pub logging: LoggingSection,
    /// Device database and access control.
    pub database: DatabaseSection,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the TCP listener binds.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
    /// Unix domain socket path; none disables the Unix listener.
    pub unix_path: Option<PathBuf>,
    /// Size of the socket handler table, listeners included.
    pub max_sockets: usize,
    /// Value format for new connections (`ascii`, `raw`, `xdr`).
    pub data_format: String,
    /// Callback poll period in milliseconds.
    pub poll_interval_ms: u64,
    /// Capacity of the callback channel.
    pub callback_queue_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let options = ServerOptions::default();
        Self {
            bind_address: options.bind_address.to_string(),
            port: DEFAULT_PORT,
            unix_path: None,
            max_sockets: DEFAULT_MAX_SOCKETS,
            data_format: options.data_format.name().to_string(),
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            callback_queue_capacity: options.callback_queue_capacity,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format (pretty, compact, json).
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// `[database]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Device database file.
    pub path: PathBuf,
    /// Connection ACL file; none admits every peer.
    pub acl_path: Option<PathBuf>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/mxserver.db.toml"),
            acl_path: None,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl ServerConfig {
    /// Load defaults, the configuration file and the environment.
    ///
    /// `path` defaults to [`DEFAULT_CONFIG_PATH`]. A missing file is not an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::figment(path).extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// The provider stack behind [`ServerConfig::load`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check every setting, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }
        if !LOG_FORMATS.contains(&self.logging.format.to_lowercase().as_str()) {
            problems.push(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                LOG_FORMATS.join(", ")
            ));
        }
        if self.server.bind_address.parse::<IpAddr>().is_err() {
            problems.push(format!(
                "Invalid server.bind_address '{}'",
                self.server.bind_address
            ));
        }
        if DataFormat::from_name(&self.server.data_format).is_none() {
            problems.push(format!(
                "Invalid server.data_format '{}'. Must be one of: ascii, raw, xdr",
                self.server.data_format
            ));
        }
        let listeners = 1 + usize::from(self.server.unix_path.is_some());
        if self.server.max_sockets <= listeners {
            problems.push(format!(
                "server.max_sockets {} leaves no room for clients after {} listener(s)",
                self.server.max_sockets, listeners
            ));
        }
        if self.server.poll_interval_ms == 0 {
            problems.push("server.poll_interval_ms must be positive".to_string());
        }
        if self.server.callback_queue_capacity == 0 {
            problems.push("server.callback_queue_capacity must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Network options for [`mx_server::MxServer::bind`].
    pub fn server_options(&self) -> Result<ServerOptions, ConfigError> {
        self.validate()?;
        let bind_address = self
            .server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(vec!["server.bind_address".to_string()]))?;
        let data_format = DataFormat::from_name(&self.server.data_format)
            .ok_or_else(|| ConfigError::Invalid(vec!["server.data_format".to_string()]))?;
        Ok(ServerOptions {
            bind_address,
            port: self.server.port,
            unix_path: self.server.unix_path.clone(),
            max_sockets: self.server.max_sockets,
            data_format,
            poll_interval: Duration::from_millis(self.server.poll_interval_ms),
            callback_queue_capacity: self.server.callback_queue_capacity,
        })
    }
}
