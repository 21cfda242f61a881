use crate::error::{ComfoError, Result};
use crate::types::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Settings of a [`crate::ComfoControlClient`]
///
/// Durations are (de)serialized as milliseconds.
///
/// ```
/// use comfoair::ClientConfig;
///
/// let config = ClientConfig::from_json(r#"{ "request_timeout": 5000, "pending_policy": "fail_fast" }"#)?;
/// assert_eq!(config.request_timeout.as_secs(), 5);
/// # Ok::<(), comfoair::ComfoError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request deadline for reads, writes and handshake steps
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Limit for opening the TCP link
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Interval between keep-alive frames while authenticated
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,

    /// Silence on the link after which the session is considered dead
    #[serde(with = "duration_ms")]
    pub watchdog_timeout: Duration,

    /// How long an expired sequence number stays unused. `None` means twice
    /// the request timeout.
    #[serde(with = "optional_duration_ms")]
    pub late_response_margin: Option<Duration>,

    pub reconnect: ReconnectConfig,

    pub pending_policy: PendingPolicy,

    /// Name announced to the unit when registering
    pub device_name: String,

    /// Identity announced to the unit when registering
    pub client_uuid: Uuid,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(90),
            late_response_margin: None,
            reconnect: ReconnectConfig::default(),
            pending_policy: PendingPolicy::default(),
            device_name: "comfoair-rs".to_string(),
            client_uuid: Uuid::new_v4(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Retirement period for expired sequence numbers
    pub fn retire_margin(&self) -> Duration {
        self.late_response_margin.unwrap_or(self.request_timeout * 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(ComfoError::Config("request_timeout must be positive".to_string()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ComfoError::Config("keepalive_interval must be positive".to_string()));
        }
        if self.watchdog_timeout <= self.keepalive_interval {
            return Err(ComfoError::Config(format!(
                "watchdog_timeout ({:?}) must exceed keepalive_interval ({:?})",
                self.watchdog_timeout, self.keepalive_interval
            )));
        }
        if self.device_name.len() > u8::MAX as usize {
            return Err(ComfoError::Config("device_name longer than 255 bytes".to_string()));
        }
        self.reconnect.validate()
    }
}

/// What reads and writes do while the session is not authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Connect if needed and wait for authentication, bounded by the request timeout
    #[default]
    Queue,
    /// Fail immediately with [`ComfoError::NotAuthenticated`]
    FailFast,
}

/// Exponential backoff for reconnecting a dropped session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay. Default: 60s.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Relative jitter applied to every delay. Default: 0.25 (±25%).
    pub jitter: f64,

    /// Attempts before the session is reported failed. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
            max_retries: Some(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (0-based)
    ///
    /// `min(initial * 2^attempt, max)` scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }

    /// Whether attempt `attempt` (0-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay > self.max_delay {
            return Err(ComfoError::Config(
                "reconnect.initial_delay exceeds reconnect.max_delay".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ComfoError::Config("reconnect.jitter must be in [0, 1)".to_string()));
        }
        Ok(())
    }
}

/// Settings of a discovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Longest time to wait for replies
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Extra time to collect more replies once the first one arrived
    #[serde(with = "duration_ms")]
    pub settle: Duration,

    /// Where the probe is sent
    pub broadcast_address: String,

    /// UDP port the probe is sent to
    pub port: u16,

    /// TCP session port recorded in discovered descriptors
    pub unit_port: u16,

    /// Pause between scans of a background [`crate::Discovery`]
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            settle: Duration::from_millis(500),
            broadcast_address: "255.255.255.255".to_string(),
            port: DEFAULT_PORT,
            unit_port: DEFAULT_PORT,
            interval: Duration::from_secs(30),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
