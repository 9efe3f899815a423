//! Session configuration.
//!
//! Loaded from TOML or built in code. Credentials are resolved indirectly
//! through environment variable names so configuration files never carry
//! secrets. Defaults mirror the common broker-SDK tuning: 1 s..32 s
//! exponential reconnect backoff with a 20 s stability window, unbounded
//! offline queueing drained at 2 Hz, 10 s connect and 5 s operation
//! timeouts.

use crate::protocol::packet::QoS;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub queue: QueueSection,
    /// Optional last-will message registered with the broker on CONNECT.
    #[serde(default)]
    pub will: Option<WillSection>,
}

/// Broker endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host[:port]` or `mqtts://host[:port]`.
    /// Defaults ports: 1883 plain, 8883 TLS.
    pub url: String,
    /// Environment variable containing the username.
    pub username_env: Option<String>,
    /// Environment variable containing the password.
    pub password_env: Option<String>,
}

/// MQTT session identity and keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Client identifier. Generated when absent.
    pub client_id: Option<String>,
    /// Ask the broker to discard prior session state.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Keep-alive interval in seconds; 0 disables PINGREQ.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    /// Largest inbound packet accepted before the connection is dropped.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

/// Connect and per-operation deadlines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// Deadline for dial + CONNECT/CONNACK handshake, in seconds.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Deadline for each acknowledged operation, in seconds.
    #[serde(default = "default_operation_secs")]
    pub operation_secs: u64,
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// First retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random jitter added to each delay, as a fraction of the delay.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// A connection held this long resets the backoff sequence, in seconds.
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
    /// Maximum reconnection attempts per outage (None = unlimited).
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Offline queue capacity and drain pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default)]
    pub policy: QueuePolicy,
    /// Capacity for the bounded policies; ignored when unbounded.
    #[serde(default)]
    pub capacity: usize,
    /// Pause between flushed messages in milliseconds (500 = 2 Hz).
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
}

/// What to do when a bounded offline queue is full.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Never drop; the queue grows without bound.
    #[default]
    Unbounded,
    /// Reject new messages once full.
    BoundedRejectNew,
    /// Evict the oldest queued message to make room.
    BoundedDropOldest,
}

/// Last-will message sent by the broker if the session dies ungracefully.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_clean_session() -> bool {
    true
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

fn default_connect_secs() -> u64 {
    10
}

fn default_operation_secs() -> u64 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_stability_window_secs() -> u64 {
    20
}

fn default_drain_interval_ms() -> u64 {
    500
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: None,
            clean_session: default_clean_session(),
            keep_alive_secs: default_keep_alive_secs(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            operation_secs: default_operation_secs(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            stability_window_secs: default_stability_window_secs(),
            max_attempts: None,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            policy: QueuePolicy::Unbounded,
            capacity: 0,
            drain_interval_ms: default_drain_interval_ms(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Build a configuration with defaults for the given broker URL.
    pub fn for_url<S: Into<String>>(url: S) -> Self {
        Self {
            broker: BrokerSection {
                url: url.into(),
                username_env: None,
                password_env: None,
            },
            session: SessionSection::default(),
            timeouts: TimeoutSection::default(),
            reconnect: ReconnectSection::default(),
            queue: QueueSection::default(),
            will: None,
        }
    }

    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field combinations that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_fraction) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.jitter_fraction must be within 0.0..=1.0".to_string(),
            ));
        }
        if let Some(0) = self.reconnect.max_attempts {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or unset for unlimited".to_string(),
            ));
        }

        if self.queue.policy != QueuePolicy::Unbounded && self.queue.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.capacity must be greater than 0 for bounded policies".to_string(),
            ));
        }
        if self.queue.drain_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.drain_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.timeouts.connect_secs == 0 || self.timeouts.operation_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if let Some(will) = &self.will {
            if QoS::try_from_u8(will.qos).is_err() {
                return Err(ConfigError::InvalidConfig(format!(
                    "will.qos must be 0, 1 or 2 (got {})",
                    will.qos
                )));
            }
            if will.topic.is_empty() || will.topic.contains(|c| c == '+' || c == '#') {
                return Err(ConfigError::InvalidConfig(
                    "will.topic must be a non-empty topic without wildcards".to_string(),
                ));
            }
        }

        if let Some(id) = &self.session.client_id {
            if id.is_empty() || id.len() > u16::MAX as usize {
                return Err(ConfigError::InvalidConfig(
                    "session.client_id must be 1..=65535 bytes".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Parse the broker URL into a connectable endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let url = url::Url::parse(&self.broker.url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?;

        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(self.broker.url.clone())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Endpoint { host, port, tls })
    }

    /// Resolve credentials from the configured environment variables.
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        let username = self
            .broker
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        let password = self
            .broker
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        (username, password)
    }

    /// Configured client id, or a generated one.
    pub fn client_id(&self) -> String {
        self.session
            .client_id
            .clone()
            .unwrap_or_else(|| format!("duramq-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.operation_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.session.keep_alive_secs))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.queue.drain_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::for_url("mqtt://localhost");
        assert!(config.validate().is_ok());
        assert!(config.session.clean_session);
        assert_eq!(config.session.keep_alive_secs, 60);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.timeouts.operation_secs, 5);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 32_000);
        assert_eq!(config.reconnect.stability_window_secs, 20);
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.queue.policy, QueuePolicy::Unbounded);
        assert_eq!(config.queue.drain_interval_ms, 500);
    }

    #[test]
    fn test_endpoint_default_ports() {
        let plain = SessionConfig::for_url("mqtt://broker.example.com");
        assert_eq!(
            plain.endpoint().unwrap(),
            Endpoint {
                host: "broker.example.com".to_string(),
                port: 1883,
                tls: false,
            }
        );

        let tls = SessionConfig::for_url("mqtts://broker.example.com");
        assert_eq!(tls.endpoint().unwrap().port, 8883);
        assert!(tls.endpoint().unwrap().tls);

        let explicit = SessionConfig::for_url("mqtt://broker.example.com:41883");
        assert_eq!(explicit.endpoint().unwrap().port, 41883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let config = SessionConfig::for_url("not a url");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        let config = SessionConfig::for_url("http://broker.example.com");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_bounded_policy_requires_capacity() {
        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.queue.policy = QueuePolicy::BoundedDropOldest;
        assert!(config.validate().is_err());

        config.queue.capacity = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_bounds_validation() {
        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.reconnect.max_delay_ms = 100;
        assert!(config.validate().is_err(), "max below base must be rejected");

        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.reconnect.jitter_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.reconnect.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_will_validation() {
        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.will = Some(WillSection {
            topic: "state/gone".to_string(),
            payload: "offline".to_string(),
            qos: 1,
            retain: true,
        });
        assert!(config.validate().is_ok());

        config.will.as_mut().unwrap().qos = 3;
        assert!(config.validate().is_err());

        config.will = Some(WillSection {
            topic: "bad/#".to_string(),
            payload: String::new(),
            qos: 0,
            retain: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_client_id_is_unique() {
        let config = SessionConfig::for_url("mqtt://localhost");
        let a = config.client_id();
        let b = config.client_id();
        assert!(a.starts_with("duramq-"));
        assert_ne!(a, b);

        let mut config = config;
        config.session.client_id = Some("fixed".to_string());
        assert_eq!(config.client_id(), "fixed");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[broker]
url = "mqtts://broker.example.com:8884"
username_env = "MQTT_USER"

[session]
client_id = "device-42"
keep_alive_secs = 30

[reconnect]
base_delay_ms = 250
max_delay_ms = 8000
max_attempts = 12

[queue]
policy = "bounded-drop-oldest"
capacity = 100
"#
        )
        .unwrap();

        let config = SessionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.session.client_id.as_deref(), Some("device-42"));
        assert_eq!(config.session.keep_alive_secs, 30);
        assert_eq!(config.reconnect.base_delay_ms, 250);
        assert_eq!(config.reconnect.max_attempts, Some(12));
        assert_eq!(config.queue.policy, QueuePolicy::BoundedDropOldest);
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.endpoint().unwrap().port, 8884);
        // Defaults fill the unspecified sections
        assert_eq!(config.timeouts.operation_secs, 5);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[broker]
url = "mqtt://localhost"

[queue]
policy = "bounded-reject-new"
"#
        )
        .unwrap();

        // bounded policy without capacity
        assert!(matches!(
            SessionConfig::load_from_file(file.path()),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_credentials_resolution() {
        let mut config = SessionConfig::for_url("mqtt://localhost");
        config.broker.username_env = Some("DURAMQ_TEST_USERNAME".to_string());
        config.broker.password_env = Some("DURAMQ_TEST_MISSING".to_string());

        std::env::set_var("DURAMQ_TEST_USERNAME", "alice");
        std::env::remove_var("DURAMQ_TEST_MISSING");

        let (username, password) = config.credentials();
        assert_eq!(username.as_deref(), Some("alice"));
        assert_eq!(password, None);
    }
}
