//! Message cache settings

use std::time::Duration;

use serde::Deserialize;

/// Message cache selection and tuning.
///
/// - `duration = 0s` disables caching entirely (nop cache)
/// - `file` unset keeps messages in memory only
/// - `file` set persists messages to SQLite, optionally batching writes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Path of the SQLite cache database; empty for in-memory
    pub file: String,

    /// How long messages are retained (also the message expiry)
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Number of messages to batch before writing to disk (0 = no batching)
    pub batch_size: usize,

    /// Longest a batched message may wait before being flushed
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            duration: Duration::from_secs(12 * 3600),
            batch_size: 0,
            batch_timeout: Duration::ZERO,
        }
    }
}

/// Attachment file cache settings. Attachments are disabled unless
/// `cache_dir` is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Directory for attachment blobs; empty disables attachments
    pub cache_dir: String,

    /// Total bytes the attachment cache may hold
    pub total_size_limit: u64,

    /// Largest single attachment in bytes
    pub file_size_limit: u64,

    /// How long attachments are kept
    #[serde(with = "humantime_serde")]
    pub expiry_duration: Duration,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            total_size_limit: 5 * 1024 * 1024 * 1024,
            file_size_limit: 15 * 1024 * 1024,
            expiry_duration: Duration::from_secs(3 * 3600),
        }
    }
}

impl AttachmentConfig {
    /// Whether attachments are enabled at all
    pub fn enabled(&self) -> bool {
        !self.cache_dir.is_empty()
    }
}
