use std::time::Duration;

use thiserror::Error;

use crate::{slot::limits::MAX_RESPONSE_BODY, transport::TransferLimits};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_transfer_bytes {0} exceeds the slot response buffer of {max}", max = MAX_RESPONSE_BODY)]
    TransferTooLarge(usize),
}

/// Settings for a [`Processor`](crate::Processor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Number of slots. Values of 0 or above
    /// [`MAX_SLOTS`](crate::slot::limits::MAX_SLOTS) are refused when the pool is built.
    pub capacity: usize,
    /// Longest time the worker blocks waiting for socket activity.
    pub poll_timeout: Duration,
    pub connect_timeout: Duration,
    /// Whole-transfer timeout. `None` lets a transfer run until the peer gives up.
    pub transfer_timeout: Option<Duration>,
    /// Largest response body the engine reads before failing the transfer.
    pub max_transfer_bytes: usize,
    /// Deliver responses outside `200..=299` through `on_error`.
    pub fail_on_http_error: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            poll_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            transfer_timeout: Some(Duration::from_secs(60)),
            max_transfer_bytes: MAX_RESPONSE_BODY,
            fail_on_http_error: true,
        }
    }
}

impl ProcessorConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_max_transfer_bytes(mut self, bytes: usize) -> Self {
        self.max_transfer_bytes = bytes;
        self
    }

    pub fn with_fail_on_http_error(mut self, fail: bool) -> Self {
        self.fail_on_http_error = fail;
        self
    }

    /// Check everything except `capacity`, which the slot pool reports itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_timeout",
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "connect_timeout",
            });
        }
        if self.transfer_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Zero {
                field: "transfer_timeout",
            });
        }
        if self.max_transfer_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "max_transfer_bytes",
            });
        }
        if self.max_transfer_bytes > MAX_RESPONSE_BODY {
            return Err(ConfigError::TransferTooLarge(self.max_transfer_bytes));
        }
        Ok(())
    }

    pub fn transfer_limits(&self) -> TransferLimits {
        TransferLimits {
            connect_timeout: self.connect_timeout,
            timeout: self.transfer_timeout,
            max_response: self.max_transfer_bytes,
        }
    }
}
