//! Bus configuration.
//!
//! [`Options`] controls the size of the worker pools, the subscriber retry
//! policy and the outbox rescan loop. Defaults are tuned for a service with
//! moderate traffic; every field can be overridden with the `with_*`
//! builder methods.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use courier::Options;
//!
//! let options = Options::default()
//!     .with_subscribers(2)
//!     .with_retry_count(5)
//!     .with_scan_interval(Duration::from_secs(30));
//!
//! assert_eq!(options.subscribers, 2);
//! assert!(options.validate("orders").is_ok());
//! ```

use std::time::Duration;

use tracing_error::SpanTrace;

/// Bus runtime options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of subscriber workers.
    pub subscribers: usize,
    /// Number of acker workers draining broker confirms.
    pub ackers: usize,
    /// Extra handler attempts after the first failure.
    pub retry_count: u32,
    /// Base interval of the exponential retry backoff.
    pub retry_interval: Duration,
    /// Whether the outbox rescan loop runs.
    pub looper_enabled: bool,
    /// Maximum number of records resubmitted per rescan.
    pub scan_limit: u64,
    /// Interval between rescans.
    pub scan_interval: Duration,
    /// Minimum time since the last send before a record is resubmitted.
    pub scan_min_age: Duration,
    /// Clear the outbox and the broker queues on start.
    pub purge_on_startup: bool,
    /// Capacity of the ack and nack channels.
    pub confirm_buffer: usize,
    /// Maximum number of idle pooled envelopes and contexts.
    pub pool_capacity: usize,
}

impl Default for Options {
    /// Provides:
    /// - 5 subscribers, 5 ackers
    /// - 3 retries starting at 10ms
    /// - rescan of up to 500 records every minute, for records idle for a minute
    fn default() -> Self {
        Self {
            subscribers: 5,
            ackers: 5,
            retry_count: 3,
            retry_interval: Duration::from_millis(10),
            looper_enabled: true,
            scan_limit: 500,
            scan_interval: Duration::from_secs(60),
            scan_min_age: Duration::from_secs(60),
            purge_on_startup: false,
            confirm_buffer: 10_000,
            pool_capacity: 1024,
        }
    }
}

impl Options {
    pub fn with_subscribers(mut self, subscribers: usize) -> Self {
        self.subscribers = subscribers;
        self
    }

    pub fn with_ackers(mut self, ackers: usize) -> Self {
        self.ackers = ackers;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_looper(mut self, enabled: bool) -> Self {
        self.looper_enabled = enabled;
        self
    }

    pub fn with_scan_limit(mut self, scan_limit: u64) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn with_scan_min_age(mut self, scan_min_age: Duration) -> Self {
        self.scan_min_age = scan_min_age;
        self
    }

    pub fn with_purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_on_startup = purge;
        self
    }

    pub fn with_confirm_buffer(mut self, confirm_buffer: usize) -> Self {
        self.confirm_buffer = confirm_buffer;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    /// Check the options for a bus running as `service`.
    ///
    /// The service name ends up in the outbox table name, so it is limited
    /// to ASCII alphanumerics and `_`.
    pub fn validate(&self, service: &str) -> Result<(), ConfigError> {
        if service.is_empty() {
            return Err(ConfigError::new(ConfigErrorKind::EmptyService));
        }
        if !service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::new(ConfigErrorKind::InvalidService(
                service.to_owned(),
            )));
        }
        if self.ackers == 0 {
            return Err(ConfigError::new(ConfigErrorKind::NoAckers));
        }
        if self.confirm_buffer == 0 {
            return Err(ConfigError::new(ConfigErrorKind::ZeroConfirmBuffer));
        }
        if self.looper_enabled {
            if self.scan_limit == 0 {
                return Err(ConfigError::new(ConfigErrorKind::ZeroScanLimit));
            }
            if self.scan_interval.is_zero() {
                return Err(ConfigError::new(ConfigErrorKind::ZeroScanInterval));
            }
        }
        Ok(())
    }
}

/// Error returned by [`Options::validate`].
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Configuration error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    EmptyService,
    /// The service name contains characters other than ASCII alphanumerics and `_`.
    InvalidService(String),
    /// Without ackers, broker confirms are never drained.
    NoAckers,
    ZeroConfirmBuffer,
    ZeroScanLimit,
    ZeroScanInterval,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::EmptyService => writeln!(f, "Service name is empty"),
            ConfigErrorKind::InvalidService(name) => writeln!(
                f,
                "Service name {name:?} may only contain ASCII alphanumerics and '_'"
            ),
            ConfigErrorKind::NoAckers => {
                writeln!(f, "At least one acker is required to drain broker confirms")
            }
            ConfigErrorKind::ZeroConfirmBuffer => writeln!(f, "Confirm buffer must not be zero"),
            ConfigErrorKind::ZeroScanLimit => writeln!(f, "Scan limit must not be zero"),
            ConfigErrorKind::ZeroScanInterval => writeln!(f, "Scan interval must not be zero"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}
