//! Transport configuration.

use std::time::Duration;

use super::backoff::BackoffPolicy;
use crate::core::{
    ConfigError, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_IMMEDIATE_RECONNECT_DELAY,
    DEFAULT_MAX_RECONNECT_INTERVAL, DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT,
    DEFAULT_RECONNECT_BACKOFF_MULTIPLIER, DEFAULT_RECONNECT_INTERVAL,
};

/// Connection transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// How long to wait for inbound traffic after a ping.
    pub pong_timeout: Duration,
    /// Maximum time a socket may take to open.
    pub connection_timeout: Duration,
    /// Base reconnect delay.
    pub reconnect_interval: Duration,
    /// Growth factor for the reconnect delay.
    pub reconnect_backoff_multiplier: f64,
    /// Cap for the reconnect delay.
    pub max_reconnect_interval: Duration,
    /// Automatic reconnect budget. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Delay used by `immediate_reconnect`.
    pub immediate_reconnect_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_backoff_multiplier: DEFAULT_RECONNECT_BACKOFF_MULTIPLIER,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            max_reconnect_attempts: None,
            immediate_reconnect_delay: DEFAULT_IMMEDIATE_RECONNECT_DELAY,
        }
    }
}

impl TransportConfig {
    /// Set the heartbeat interval and pong timeout.
    pub fn with_heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the reconnect schedule.
    pub fn with_reconnect(mut self, base: Duration, multiplier: f64, cap: Duration) -> Self {
        self.reconnect_interval = base;
        self.reconnect_backoff_multiplier = multiplier;
        self.max_reconnect_interval = cap;
        self
    }

    /// Limit automatic reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the delay used by `immediate_reconnect`.
    pub fn with_immediate_reconnect_delay(mut self, delay: Duration) -> Self {
        self.immediate_reconnect_delay = delay;
        self
    }

    /// Reconnect schedule for this configuration.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.reconnect_interval,
            multiplier: self.reconnect_backoff_multiplier,
            cap: self.max_reconnect_interval,
        }
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("ping_interval", self.ping_interval),
            ("pong_timeout", self.pong_timeout),
            ("connection_timeout", self.connection_timeout),
            ("reconnect_interval", self.reconnect_interval),
            ("max_reconnect_interval", self.max_reconnect_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.pong_timeout >= self.ping_interval {
            return Err(ConfigError::PongTimeoutTooLong);
        }
        if !self.reconnect_backoff_multiplier.is_finite() || self.reconnect_backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier);
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(ConfigError::InvalidReconnectCap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(TransportConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_pong_must_fit_in_ping() {
        let config = TransportConfig::default()
            .with_heartbeat(Duration::from_millis(500), Duration::from_millis(500));
        assert_eq!(config.validate(), Err(ConfigError::PongTimeoutTooLong));
    }

    #[test]
    fn test_invalid_reconnect_values() {
        let config = TransportConfig::default().with_reconnect(
            Duration::from_secs(1),
            0.5,
            Duration::from_secs(30),
        );
        assert_eq!(config.validate(), Err(ConfigError::InvalidMultiplier));

        let config = TransportConfig::default().with_reconnect(
            Duration::from_secs(10),
            2.0,
            Duration::from_secs(1),
        );
        assert_eq!(config.validate(), Err(ConfigError::InvalidReconnectCap));

        let config = TransportConfig::default().with_connection_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("connection_timeout"))
        );
    }
}
