//! Explicit configuration objects handed to sessions and stream ciphers at construction time.

use core::time::Duration;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::msg_key_cache::{DEFAULT_MAX_SKIP, DEFAULT_MKS_CAPACITY};
use crate::replay::DEFAULT_REPLAY_WINDOW;

/// Default plaintext size of one stream chunk (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Default number of bytes encrypted under one stream key before rotation is due (10 MiB)
pub const DEFAULT_ROTATION_BYTES: u64 = 10 * 1024 * 1024;

/// Default lifetime of one stream key before rotation is due (5 minutes)
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value the crate cannot work with
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    /// The JSON document could not be parsed or produced
    #[cfg(feature = "serde")]
    #[error("configuration JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Limits of the Double Ratchet control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RatchetConfig {
    /// Most message keys a single decryption may derive (target key included)
    pub max_skip: usize,
    /// Capacity of the skipped-key cache; the oldest keys are evicted first
    pub max_skipped_keys: usize,
    /// Number of remote ratchet keys whose consumed message numbers are remembered
    pub replay_window: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_keys: DEFAULT_MKS_CAPACITY,
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }
}

impl RatchetConfig {
    /// # Errors
    /// `ConfigError::Invalid` when a limit is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_skip == 0 {
            return Err(ConfigError::Invalid("max_skip must be at least 1"));
        }
        if self.replay_window == 0 {
            return Err(ConfigError::Invalid("replay_window must be at least 1"));
        }
        Ok(())
    }
}

/// Chunking and rotation policy of the stream cipher.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StreamConfig {
    /// Largest plaintext carried by one chunk
    pub chunk_size: u32,
    /// Bytes encrypted under one key after which rotation is due
    pub rotation_bytes: u64,
    /// Age of a key, in seconds, after which rotation is due
    pub rotation_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            rotation_bytes: DEFAULT_ROTATION_BYTES,
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
        }
    }
}

impl StreamConfig {
    /// `rotation_interval_secs` as a `Duration`
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// # Errors
    /// `ConfigError::Invalid` when the chunk size or a rotation threshold is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1"));
        }
        if self.rotation_bytes == 0 {
            return Err(ConfigError::Invalid("rotation_bytes must be at least 1"));
        }
        if self.rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "rotation_interval_secs must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Everything a [`SecureChannel`](crate::channel::SecureChannel) needs to know.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChannelConfig {
    /// control channel limits
    pub ratchet: RatchetConfig,
    /// bulk data policy
    pub stream: StreamConfig,
}

impl ChannelConfig {
    /// # Errors
    /// the first `ConfigError::Invalid` found in either section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ratchet.validate()?;
        self.stream.validate()
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    /// `ConfigError::Json` on malformed JSON, `ConfigError::Invalid` on rejected values
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `ConfigError::Json` if serialization fails
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.ratchet.max_skip, 1000);
        assert_eq!(config.ratchet.max_skipped_keys, 1000);
        assert_eq!(config.stream.chunk_size, 65536);
        assert_eq!(config.stream.rotation_bytes, 10 * 1024 * 1024);
        assert_eq!(config.stream.rotation_interval(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = ChannelConfig::default();
        config.stream.chunk_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ChannelConfig::default();
        config.ratchet.max_skip = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_round_trip() {
        let mut config = ChannelConfig::default();
        config.ratchet.replay_window = 8;
        config.stream.chunk_size = 4096;
        let json = config.to_json().unwrap();
        assert_eq!(ChannelConfig::from_json(&json).unwrap(), config);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_partial_document_uses_defaults() {
        let config = ChannelConfig::from_json(r#"{ "stream": { "chunk_size": 1024 } }"#).unwrap();
        assert_eq!(config.stream.chunk_size, 1024);
        assert_eq!(config.stream.rotation_interval_secs, 300);
        assert_eq!(config.ratchet, RatchetConfig::default());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_errors() {
        assert!(matches!(
            ChannelConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            ChannelConfig::from_json(r#"{ "stream": { "chunk_size": 0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}
