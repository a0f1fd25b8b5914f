//! Configuration types for wirekit

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration
///
/// Every section has sensible defaults, so `Config::default()` works out of
/// the box and a JSON document only needs the keys it wants to override.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default transport settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Default retry policy for requests and transfers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Debug capture of request/response pairs
    #[serde(default)]
    pub debug_capture: DebugCaptureConfig,

    /// Upload and download settings
    #[serde(default)]
    pub transfers: TransferConfig,

    /// Reachability probing
    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

impl Config {
    /// Check values that would make components misbehave
    pub fn validate(&self) -> Result<()> {
        if self.transfers.state_channel_capacity == 0 {
            return Err(Error::Config {
                message: "state channel capacity must be at least 1".to_string(),
                key: Some("transfers.state_channel_capacity".to_string()),
            });
        }
        if self.transfers.multipart_buffer_size == 0 {
            return Err(Error::Config {
                message: "multipart buffer size must be at least 1 byte".to_string(),
                key: Some("transfers.multipart_buffer_size".to_string()),
            });
        }
        if self.reachability.interval.is_zero() {
            return Err(Error::Config {
                message: "reachability interval must be non-zero".to_string(),
                key: Some("reachability.interval".to_string()),
            });
        }
        if self.http.timeout.is_zero() {
            return Err(Error::Config {
                message: "request timeout must be non-zero".to_string(),
                key: Some("http.timeout".to_string()),
            });
        }
        Ok(())
    }
}

/// Settings for the default reqwest transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Whole-request timeout (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Connection timeout (default: 10 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: None,
        }
    }
}

/// How long to wait before the next attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayPolicy {
    /// Same delay before every retry
    Constant {
        /// Delay in milliseconds
        #[serde(with = "duration_millis_serde")]
        delay: Duration,
    },
    /// `base * attempt`, where the first retry is attempt 1
    Progressive {
        /// Base delay in milliseconds
        #[serde(with = "duration_millis_serde")]
        base: Duration,
    },
}

impl DelayPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            DelayPolicy::Constant { delay } => *delay,
            DelayPolicy::Progressive { base } => base.saturating_mul(attempt.max(1)),
        }
    }
}

impl Default for DelayPolicy {
    fn default() -> Self {
        DelayPolicy::Constant {
            delay: Duration::from_secs(2),
        }
    }
}

/// Caller-supplied decision whether an error deserves another attempt
///
/// When unset, [`IsRetryable`](crate::retry::IsRetryable) decides.
#[derive(Clone, Default)]
pub struct RetryPredicate(Option<Arc<dyn Fn(&Error) -> bool + Send + Sync>>);

impl RetryPredicate {
    /// Wrap a closure
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self(Some(Arc::new(predicate)))
    }

    /// Evaluate the predicate, falling back to the error's own classification
    pub fn allows(&self, error: &Error) -> bool {
        use crate::retry::IsRetryable;
        match &self.0 {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("RetryPredicate(custom)"),
            None => f.write_str("RetryPredicate(default)"),
        }
    }
}

/// Retry behavior for one logical call or transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay policy (default: constant 2 seconds)
    #[serde(default)]
    pub delay: DelayPolicy,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,

    /// Which errors are retryable
    #[serde(skip)]
    pub predicate: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            delay: DelayPolicy::default(),
            jitter: false,
            predicate: RetryPredicate::default(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry limit
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the delay policy
    pub fn with_delay(mut self, delay: DelayPolicy) -> Self {
        self.delay = delay;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryability predicate
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = RetryPredicate::new(predicate);
        self
    }

    /// Whether `error` may be retried at all under this policy
    pub fn is_retryable(&self, error: &Error) -> bool {
        self.predicate.allows(error)
    }

    /// Delay before retry number `attempt` (1-based), jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay.delay_for(attempt);
        if self.jitter {
            crate::retry::add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Debug capture of request/response pairs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebugCaptureConfig {
    /// Capture in debug builds (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Root directory for per-session capture folders (default: "./debug-captures")
    #[serde(default = "default_capture_dir")]
    pub directory: PathBuf,
}

impl Default for DebugCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_capture_dir(),
        }
    }
}

/// Upload and download settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Durable destination for finished downloads (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Temporary directory for partial downloads and encoded multipart bodies (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Pause between emitting a terminal state and closing the state stream (default: 100 ms)
    #[serde(default = "default_grace_delay", with = "duration_millis_serde")]
    pub terminal_grace_delay: Duration,

    /// Capacity of each subscriber's state channel (default: 64)
    #[serde(default = "default_state_capacity")]
    pub state_channel_capacity: usize,

    /// Buffer size used when streaming multipart bodies to disk (default: 64 KiB)
    #[serde(default = "default_multipart_buffer")]
    pub multipart_buffer_size: usize,

    /// Multipart forms larger than this are encoded to a temporary file (default: 10 MiB)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_memory_threshold: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            terminal_grace_delay: default_grace_delay(),
            state_channel_capacity: default_state_capacity(),
            multipart_buffer_size: default_multipart_buffer(),
            multipart_memory_threshold: default_multipart_threshold(),
        }
    }
}

/// Reachability probing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// Host to probe (default: "1.1.1.1")
    #[serde(default = "default_probe_host")]
    pub host: String,

    /// Port to probe (default: 443)
    #[serde(default = "default_probe_port")]
    pub port: u16,

    /// Interval between probes (default: 10 seconds)
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub interval: Duration,

    /// Timeout of a single probe (default: 3 seconds)
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retries() -> u32 {
    3
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("./debug-captures")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_grace_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_state_capacity() -> usize {
    64
}

fn default_multipart_buffer() -> usize {
    64 * 1024
}

fn default_multipart_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_probe_host() -> String {
    "1.1.1.1".to_string()
}

fn default_probe_port() -> u16 {
    443
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy_matches_documented_values() {
        let config = RetryConfig::default();
        assert_eq!(config.retries, 3);
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(2));
    }

    #[test]
    fn progressive_delay_scales_with_attempt() {
        let policy = DelayPolicy::Progressive {
            base: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn custom_predicate_overrides_default() {
        let config = RetryConfig::default().with_predicate(|e| matches!(e, Error::Timeout));
        assert!(config.is_retryable(&Error::Timeout));
        assert!(!config.is_retryable(&Error::Transport("reset".into())));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{ "retry": { "retries": 5, "delay": { "kind": "progressive", "base": 250 } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.retry.retries, 5);
        assert_eq!(
            config.retry.delay,
            DelayPolicy::Progressive {
                base: Duration::from_millis(250)
            }
        );
        assert_eq!(config.http.timeout, Duration::from_secs(60));
        assert_eq!(config.transfers.state_channel_capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.transfers.state_channel_capacity = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("transfers.state_channel_capacity"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
