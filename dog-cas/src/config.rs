use std::time::Duration;

use crate::{CasError, CasResult};

/// Configuration for a [`CasStore`](crate::CasStore)
#[derive(Debug, Clone)]
pub struct CasConfig {
    /// Post-close visibility confirmation for writes
    pub confirm: ConfirmConfig,

    /// Chunks buffered between a handle and its background transfer.
    /// A writer blocks once this many chunks are waiting.
    pub pipe_depth: usize,

    /// Chunk size used when feeding a downloaded object to a reader
    pub read_chunk_bytes: usize,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            confirm: ConfirmConfig::default(),
            pipe_depth: 1,
            read_chunk_bytes: 32 * 1024, // 32KB
        }
    }
}

/// How a write handle confirms its object became visible after close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmConfig {
    /// Poll for visibility on close
    pub enabled: bool,

    /// Give up after this long
    pub timeout: Duration,

    /// Delay between HEAD requests
    pub poll_interval: Duration,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl ConfirmConfig {
    /// Confirmation switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl CasConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from `DOG_CAS_CONFIRM`, `DOG_CAS_CONFIRM_TIMEOUT_MS`
    /// and `DOG_CAS_CONFIRM_POLL_MS`. Unset variables keep their default.
    pub fn from_env() -> CasResult<Self> {
        fn get_env(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        fn millis(key: &str, value: String) -> CasResult<Duration> {
            value
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| CasError::invalid(format!("{} must be a number of milliseconds, got {:?}", key, value)))
        }

        let mut config = Self::default();

        if let Some(value) = get_env("DOG_CAS_CONFIRM") {
            config.confirm.enabled = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(CasError::invalid(format!("DOG_CAS_CONFIRM must be a boolean, got {:?}", value))),
            };
        }
        if let Some(value) = get_env("DOG_CAS_CONFIRM_TIMEOUT_MS") {
            config.confirm.timeout = millis("DOG_CAS_CONFIRM_TIMEOUT_MS", value)?;
        }
        if let Some(value) = get_env("DOG_CAS_CONFIRM_POLL_MS") {
            config.confirm.poll_interval = millis("DOG_CAS_CONFIRM_POLL_MS", value)?;
        }

        Ok(config)
    }

    /// Set the confirmation settings
    pub fn with_confirm(mut self, confirm: ConfirmConfig) -> Self {
        self.confirm = confirm;
        self
    }

    /// Skip visibility confirmation on close
    pub fn without_confirm(mut self) -> Self {
        self.confirm.enabled = false;
        self
    }

    /// Set the confirmation timeout
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm.timeout = timeout;
        self
    }

    /// Set the confirmation poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.confirm.poll_interval = interval;
        self
    }

    /// Set the pipe depth in chunks
    pub fn with_pipe_depth(mut self, depth: usize) -> Self {
        self.pipe_depth = depth;
        self
    }

    /// Set the chunk size used for reads
    pub fn with_read_chunk_bytes(mut self, bytes: usize) -> Self {
        self.read_chunk_bytes = bytes;
        self
    }

    pub(crate) fn validate(&self) -> CasResult<()> {
        if self.pipe_depth == 0 {
            return Err(CasError::invalid("pipe_depth must be at least 1"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(CasError::invalid("read_chunk_bytes must be at least 1"));
        }
        if self.confirm.enabled && self.confirm.poll_interval.is_zero() {
            return Err(CasError::invalid("confirm poll_interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CasConfig::default();
        assert!(config.confirm.enabled);
        assert_eq!(config.confirm.timeout, Duration::from_secs(5));
        assert_eq!(config.confirm.poll_interval, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_rejected_only_when_confirming() {
        let config = CasConfig::new().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(config.without_confirm().validate().is_ok());
    }

    #[test]
    fn zero_pipe_depth_is_rejected() {
        assert!(CasConfig::new().with_pipe_depth(0).validate().is_err());
    }
}
