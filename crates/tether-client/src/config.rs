//! Session configuration.
//!
//! Every field has a default, so an empty TOML document (or
//! `SessionConfig::default()`) is a working configuration.
//!
//! ```toml
//! [connection]
//! debounce_ms = 50
//! backoff_base_ms = 500
//!
//! [navigation]
//! load_timeout_ms = 10000
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Floor for periodic timers, whatever the configuration says.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub credentials: CredentialConfig,
    pub navigation: NavigationConfig,
    pub reconcile: ReconcileConfig,
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject periods of zero, which would spin or stall background tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("credentials.min_check_ms", self.credentials.min_check_ms),
            ("credentials.max_check_ms", self.credentials.max_check_ms),
            ("reconcile.sweep_interval_ms", self.reconcile.sweep_interval_ms),
            ("reconcile.pending_timeout_ms", self.reconcile.pending_timeout_ms),
            ("navigation.load_timeout_ms", self.navigation.load_timeout_ms),
        ];
        match periods.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Window over which credential/identity changes are coalesced.
    pub debounce_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Reconnect attempts after a recoverable failure before giving up.
    pub max_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl ConnectionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1).min(16));
        let delay = self.backoff_base_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Store key holding the serialized credential.
    pub storage_key: String,
    pub min_check_ms: u64,
    pub max_check_ms: u64,
    /// Treat removal of the stored credential by another process as logout.
    pub follow_external_logout: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            storage_key: "tether.credential".to_string(),
            min_check_ms: 5_000,
            max_check_ms: 120_000,
            follow_external_logout: true,
        }
    }
}

impl CredentialConfig {
    /// How often to ask whether a credential with this lifetime needs
    /// refreshing: a third of the lifetime, clamped.
    pub fn check_interval(&self, lifetime: Duration) -> Duration {
        let min = Duration::from_millis(self.min_check_ms).max(MIN_PERIOD);
        let max = Duration::from_millis(self.max_check_ms).max(min);
        (lifetime / 3).clamp(min, max)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub load_timeout_ms: u64,
    /// Load attempts for transient failures (including the first).
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Extra attempts granted after a timeout.
    pub timeout_retries: u32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 10_000,
            max_attempts: 3,
            retry_delay_ms: 250,
            timeout_retries: 1,
        }
    }
}

impl NavigationConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Delay before retry `retry` (1-based), doubling each time.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(retry.saturating_sub(1).min(16));
        Duration::from_millis(self.retry_delay_ms.saturating_mul(multiplier))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How long a message may stay pending before it is marked timed out.
    pub pending_timeout_ms: u64,
    /// How recent a pending message must be to match an un-tagged echo.
    pub match_window_ms: u64,
    /// How long confirmed ids stay in the duplicate index.
    pub confirmed_retention_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 30_000,
            match_window_ms: 15_000,
            confirmed_retention_ms: 600_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl ReconcileConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn match_window(&self) -> Duration {
        Duration::from_millis(self.match_window_ms)
    }

    pub fn confirmed_retention(&self) -> Duration {
        Duration::from_millis(self.confirmed_retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms).max(MIN_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config.connection.debounce(), Duration::from_millis(50));
        assert_eq!(config.credentials.storage_key, "tether.credential");
        assert_eq!(config.navigation.load_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_override() {
        let config = SessionConfig::from_toml_str(
            r#"
            [connection]
            max_attempts = 2

            [reconcile]
            pending_timeout_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.max_attempts, 2);
        assert_eq!(config.connection.debounce_ms, 50);
        assert_eq!(config.reconcile.pending_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_types() {
        assert!(SessionConfig::from_toml_str("[connection]\ndebounce_ms = \"soon\"").is_err());
    }

    #[test]
    fn zero_periods_are_rejected() {
        let err = SessionConfig::from_toml_str("[reconcile]\nsweep_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "reconcile.sweep_interval_ms" }));

        let err = SessionConfig::from_toml_str("[credentials]\nmin_check_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "credentials.min_check_ms" }));

        assert!(SessionConfig::from_toml_str("[connection]\ndebounce_ms = 0").is_ok());
    }

    #[test]
    fn periods_built_in_code_never_reach_zero() {
        let reconcile = ReconcileConfig {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(reconcile.sweep_interval(), Duration::from_millis(1));

        let credentials = CredentialConfig {
            min_check_ms: 0,
            ..Default::default()
        };
        assert_eq!(credentials.check_interval(Duration::from_secs(2)), Duration::from_secs(2) / 3);
        assert_eq!(credentials.check_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let c = ConnectionConfig::default();
        assert_eq!(c.backoff(1), Duration::from_millis(500));
        assert_eq!(c.backoff(2), Duration::from_millis(1000));
        assert_eq!(c.backoff(4), Duration::from_millis(4000));
        assert_eq!(c.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn check_interval_scales_with_lifetime() {
        let c = CredentialConfig::default();
        assert_eq!(c.check_interval(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(c.check_interval(Duration::from_secs(900)), Duration::from_secs(120));
        assert_eq!(c.check_interval(Duration::from_secs(3)), Duration::from_secs(5));
    }
}
