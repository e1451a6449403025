//! Tunables of a connection.
//!
//! Defaults match a typical cluster deployment: 1 MiB ring buffers, a send
//! queue of 64 work requests, a two second resolve timeout and blocking calls
//! that never time out.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::flow_control::{MAX_DEPTH, MIN_DEPTH};

pub const DEFAULT_RESOLVE_TIMEOUT_MS: u32 = 2000;
pub const DEFAULT_RING_BUFFER_SIZE_MB: u32 = 1;
pub const DEFAULT_SEND_QUEUE_DEPTH: u32 = 64;

pub const ENV_RESOLVE_TIMEOUT_MS: &str = "RDMA_RESOLVE_TIMEOUT_MS";
pub const ENV_TIMEOUT_MS: &str = "RDMA_TIMEOUT_MS";
pub const ENV_RING_BUFFER_SIZE_MB: &str = "RDMA_RING_BUFFER_SIZE_MB";
pub const ENV_SEND_QUEUE_DEPTH: &str = "RDMA_SEND_QUEUE_DEPTH";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Limit for address and route resolution.
    pub resolve_timeout_ms: u32,
    /// Limit for blocking handshake, read and write calls. `None` waits forever.
    pub timeout_ms: Option<u32>,
    /// Capacity of the source and sink ring buffers.
    pub ring_buffer_size_mb: u32,
    /// Work requests per send and receive queue proposed to the peer.
    pub send_queue_depth: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: DEFAULT_RESOLVE_TIMEOUT_MS,
            timeout_ms: None,
            ring_buffer_size_mb: DEFAULT_RING_BUFFER_SIZE_MB,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
        }
    }
}

impl Config {
    /// Defaults overridden by any `RDMA_*` environment variables that are set.
    ///
    /// `RDMA_TIMEOUT_MS=0` (or any negative value) selects an infinite timeout.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = read_env::<u32>(ENV_RESOLVE_TIMEOUT_MS)? {
            config.resolve_timeout_ms = ms;
        }
        if let Some(ms) = read_env::<i64>(ENV_TIMEOUT_MS)? {
            config.timeout_ms = if ms <= 0 {
                None
            } else {
                Some(u32::try_from(ms).unwrap_or(u32::MAX))
            };
        }
        if let Some(mb) = read_env::<u32>(ENV_RING_BUFFER_SIZE_MB)? {
            config.ring_buffer_size_mb = mb;
        }
        if let Some(depth) = read_env::<u32>(ENV_SEND_QUEUE_DEPTH)? {
            config.send_queue_depth = depth;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON object; missing fields keep their defaults.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let (config, _): (Self, usize) = serde_json_core::from_slice(json)
            .map_err(|err| Error::Config(format!("failed to parse json, {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_buffer_size_mb == 0 {
            return Err(Error::Config("ring buffer size must be non-zero".into()));
        }
        if (self.ring_buffer_size_mb as u64) << 20 > u32::MAX as u64 {
            return Err(Error::Config(format!(
                "ring buffer of {} MiB does not fit a 32-bit length",
                self.ring_buffer_size_mb
            )));
        }
        if self.send_queue_depth < MIN_DEPTH || self.send_queue_depth > MAX_DEPTH {
            return Err(Error::Config(format!(
                "send queue depth {} out of range",
                self.send_queue_depth
            )));
        }
        Ok(())
    }

    pub fn ring_buffer_size(&self) -> usize {
        (self.ring_buffer_size_mb as usize) << 20
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms as u64)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms =
            timeout.map(|timeout| u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        self
    }

    pub fn with_ring_buffer_size_mb(mut self, mb: u32) -> Self {
        self.ring_buffer_size_mb = mb;
        self
    }

    pub fn with_send_queue_depth(mut self, depth: u32) -> Self {
        self.send_queue_depth = depth;
        self
    }
}

fn read_env<T: core::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| {
            warn!("malformed {key}={value}");
            Error::Config(format!("malformed {key}={value}"))
        }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(Error::Config(format!("{key}, {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(1 << 20, config.ring_buffer_size());
        assert_eq!(None, config.timeout());
        assert_eq!(Duration::from_secs(2), config.resolve_timeout());
    }

    #[test]
    fn json_overrides_some_fields() {
        let config =
            Config::from_json(br#"{"timeout_ms": 100, "send_queue_depth": 16}"#).unwrap();
        assert_eq!(Some(Duration::from_millis(100)), config.timeout());
        assert_eq!(16, config.send_queue_depth);
        assert_eq!(DEFAULT_RING_BUFFER_SIZE_MB, config.ring_buffer_size_mb);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_json(br#"{"ring_buffer_size_mb": 0}"#).is_err());
        assert!(Config::from_json(br#"{"send_queue_depth": 1}"#).is_err());
        assert!(Config::default()
            .with_send_queue_depth(MAX_DEPTH + 1)
            .validate()
            .is_err());
        assert!(Config::from_json(b"not json").is_err());
        assert!(Config::default()
            .with_ring_buffer_size_mb(8192)
            .validate()
            .is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        env::set_var(ENV_SEND_QUEUE_DEPTH, "32");
        env::set_var(ENV_TIMEOUT_MS, "0");
        let config = Config::from_env().unwrap();
        env::remove_var(ENV_SEND_QUEUE_DEPTH);
        env::remove_var(ENV_TIMEOUT_MS);
        assert_eq!(32, config.send_queue_depth);
        assert_eq!(None, config.timeout_ms);
    }
}
