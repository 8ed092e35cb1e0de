//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use pm_protocol::MAX_PAYLOAD_SIZE;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Bytes of bincode framing around a `Data` payload
const DATA_ENVELOPE: usize = 16;

/// Configuration for the incoming and outgoing bridges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host the relay and per-peer listeners bind to
    pub bind_host: String,

    /// Fixed relay listener port; 0 picks an ephemeral port
    pub relay_port: u16,

    /// Bound on dialing the application server or a forward native port
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// How long a reverse connection waits for its relay socket to be accepted
    #[serde(with = "duration_millis")]
    pub reverse_connection_wait: Duration,

    /// Inactivity timeout for relay sessions; 0 disables it
    ///
    /// A native link that drops without a FIN is only noticed through this.
    #[serde(with = "duration_secs")]
    pub incoming_idle_timeout: Duration,

    /// Inactivity timeout for outgoing peer sessions; 0 disables it
    #[serde(with = "duration_secs")]
    pub peer_idle_timeout: Duration,

    /// Maximum number of simultaneous peer listeners
    pub max_peer_listeners: usize,

    /// Consecutive failed recreations before a peer is given up
    pub max_recreate_attempts: u32,

    /// Backoff between recreation attempts
    pub recreate_backoff: BackoffConfig,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,

    /// Multiplexed session settings
    pub mux: MuxConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            relay_port: 0,
            connect_timeout: Duration::from_secs(5),
            reverse_connection_wait: Duration::from_secs(1),
            incoming_idle_timeout: Duration::from_secs(60),
            peer_idle_timeout: Duration::from_secs(60),
            max_peer_listeners: 20,
            max_recreate_attempts: 5,
            recreate_backoff: BackoffConfig::default(),
            event_capacity: 256,
            mux: MuxConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Check values that would otherwise fail at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peer_listeners == 0 {
            return Err(ConfigError::Invalid(
                "max_peer_listeners must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        self.recreate_backoff.validate()?;
        self.mux.validate()
    }

    /// Session settings for relay sessions
    pub fn incoming_mux(&self) -> MuxConfig {
        self.mux
            .clone()
            .with_idle_timeout(enabled(self.incoming_idle_timeout))
    }

    /// Session settings for outgoing peer sessions
    pub fn outgoing_mux(&self) -> MuxConfig {
        self.mux
            .clone()
            .with_idle_timeout(enabled(self.peer_idle_timeout))
    }
}

fn enabled(timeout: Duration) -> Option<Duration> {
    Some(timeout).filter(|t| !t.is_zero())
}

/// Multiplexed session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Largest payload carried by one `Data` frame
    pub max_frame_payload: usize,

    /// Frames buffered per stream before the session stops reading
    pub stream_buffer: usize,

    /// Frames queued for the writer task
    pub outbound_buffer: usize,

    /// Session ends after this long without frames in either direction
    #[serde(skip)]
    pub idle_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 32 * 1024,
            stream_buffer: 64,
            outbound_buffer: 256,
            idle_timeout: None,
        }
    }
}

impl MuxConfig {
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_PAYLOAD_SIZE - DATA_ENVELOPE
        {
            return Err(ConfigError::Invalid(format!(
                "mux.max_frame_payload must be between 1 and {}",
                MAX_PAYLOAD_SIZE - DATA_ENVELOPE
            )));
        }
        if self.stream_buffer == 0 || self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "mux buffers must hold at least one frame".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "backoff jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.reverse_connection_wait, Duration::from_secs(1));
        assert_eq!(config.max_peer_listeners, 20);
        assert_eq!(config.incoming_idle_timeout, Duration::from_secs(60));
        assert_eq!(
            config.outgoing_mux().idle_timeout,
            Some(Duration::from_secs(60))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            connect_timeout = 250
            peer_idle_timeout = 30

            [mux]
            max_frame_payload = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.peer_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.incoming_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.mux.max_frame_payload, 1024);
        assert_eq!(config.mux.stream_buffer, 64);
        assert_eq!(config.max_recreate_attempts, 5);
    }

    #[test]
    fn test_idle_timeouts_flow_into_mux_settings() {
        let config = BridgeConfig {
            incoming_idle_timeout: Duration::from_secs(3),
            peer_idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.incoming_mux().idle_timeout,
            Some(Duration::from_secs(3))
        );
        // Zero disables
        assert_eq!(config.outgoing_mux().idle_timeout, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.mux.max_frame_payload = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.max_peer_listeners = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.recreate_backoff.jitter = 1.5;
        assert!(config.validate().is_err());
    }
}
