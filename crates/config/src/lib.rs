//! Herald Configuration
//!
//! TOML-based configuration loading with sensible defaults.
//! Minimal config should just work - only specify what you need to change.
//!
//! # Parsing
//!
//! Use the `FromStr` trait to parse configuration:
//!
//! ```
//! use herald_config::Config;
//! use std::str::FromStr;
//!
//! let config = Config::from_str("[server]\nbase_url = \"https://push.example.com\"").unwrap();
//! ```
//!
//! # Example Minimal Config
//!
//! ```toml
//! [server]
//! base_url = "https://push.example.com"
//!
//! [cache]
//! file = "/var/lib/herald/cache.db"
//!
//! [attachments]
//! cache_dir = "/var/lib/herald/attachments"
//! ```

mod cache;
mod error;
mod limits;
mod logging;
mod relay;
mod server;

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

pub use cache::{AttachmentConfig, CacheConfig};
pub use error::{ConfigError, Result};
pub use limits::LimitsConfig;
pub use logging::{LogConfig, LogLevel};
pub use relay::{PushConfig, SmtpConfig, UpstreamConfig};
pub use server::ServerConfig;

/// Main configuration structure
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Core server settings (listeners, topic policy, intervals)
    pub server: ServerConfig,

    /// Logging configuration
    pub log: LogConfig,

    /// Message cache selection and tuning
    pub cache: CacheConfig,

    /// Attachment file cache
    pub attachments: AttachmentConfig,

    /// Per-visitor rate limits
    pub limits: LimitsConfig,

    /// Mobile push relay
    pub push: PushConfig,

    /// Outbound mail
    pub smtp: SmtpConfig,

    /// Upstream poll-request forwarding
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or contains invalid TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string
    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.server.message_limit == 0 {
            return Err(ConfigError::invalid_value("server.message_limit", "must be > 0"));
        }
        if self.server.min_delay > self.server.max_delay {
            return Err(ConfigError::invalid_value(
                "server.min_delay",
                "must not exceed server.max_delay",
            ));
        }
        if self.server.stats_reset_time().is_none() {
            return Err(ConfigError::invalid_value(
                "server.visitor_stats_reset_time",
                format!("'{}' is not HH:MM", self.server.visitor_stats_reset_time),
            ));
        }
        if self.attachments.enabled() && self.server.base_url.is_empty() {
            return Err(ConfigError::MissingDependency {
                field: "attachments.cache_dir",
                requires: "server.base_url",
            });
        }
        if !self.upstream.base_url.is_empty() && self.server.base_url.is_empty() {
            return Err(ConfigError::MissingDependency {
                field: "upstream.base_url",
                requires: "server.base_url",
            });
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
