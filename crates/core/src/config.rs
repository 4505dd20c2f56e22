//! Configuration for the listen, replicated set and lock services.
//!
//! Durations are written as whole milliseconds and keys use camelCase:
//!
//! ```toml
//! serverName = "node-a"
//!
//! [listen]
//! responseTimeout = 500
//! shuffleProviders = false
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ConfigError;

/// Default time a provider has to answer an offer.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default interval between rematch passes.
pub const DEFAULT_REMATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Default time before a node retries a name no provider accepted.
pub const DEFAULT_MATCH_COOLDOWN: Duration = Duration::from_secs(10);

/// Default debounce window for checksum broadcasts.
pub const DEFAULT_CHECK_SUM_BUFFER: Duration = Duration::from_millis(100);

/// Default delay before a checksum mismatch requests full state.
pub const DEFAULT_STATE_RECONCILIATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Default time after which a granted lock is released automatically.
pub const DEFAULT_LOCK_HOLD_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time a lock request waits for the leader.
pub const DEFAULT_LOCK_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for provider discovery.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenConfig {
    /// Time a candidate has to accept or reject an offer.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,

    /// Interval between rematch passes. Values below one second disable rematching.
    #[serde(with = "duration_ms")]
    pub rematch_interval: Duration,

    /// Whether candidates are offered in random order.
    pub shuffle_providers: bool,

    /// Time a node waits before retrying a name after an unsuccessful round.
    #[serde(with = "duration_ms")]
    pub match_cooldown: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            rematch_interval: DEFAULT_REMATCH_INTERVAL,
            shuffle_providers: true,
            match_cooldown: DEFAULT_MATCH_COOLDOWN,
        }
    }
}

/// Settings for replicated sets.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateRegistryConfig {
    /// Debounce window for checksum broadcasts and verification.
    #[serde(with = "duration_ms")]
    pub check_sum_buffer: Duration,

    /// Delay before a mismatch requests full state, and the window in which
    /// repeated full-state requests from the same node are ignored.
    #[serde(with = "duration_ms")]
    pub state_reconciliation_timeout: Duration,
}

impl Default for StateRegistryConfig {
    fn default() -> Self {
        Self {
            check_sum_buffer: DEFAULT_CHECK_SUM_BUFFER,
            state_reconciliation_timeout: DEFAULT_STATE_RECONCILIATION_TIMEOUT,
        }
    }
}

/// Settings for the cluster lock service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    /// Time after which the leader releases a lock nobody released.
    #[serde(with = "duration_ms")]
    pub hold_timeout: Duration,

    /// Time a follower waits for the leader to answer a lock request.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_timeout: DEFAULT_LOCK_HOLD_TIMEOUT,
            request_timeout: DEFAULT_LOCK_REQUEST_TIMEOUT,
        }
    }
}

/// Top-level node configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeraldConfig {
    /// Name of this node in the cluster.
    pub server_name: String,

    /// Provider discovery settings.
    pub listen: ListenConfig,

    /// Replicated set settings.
    pub state_registry: StateRegistryConfig,

    /// Lock service settings.
    pub lock: LockConfig,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            server_name: "herald".to_string(),
            listen: ListenConfig::default(),
            state_registry: StateRegistryConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl HeraldConfig {
    /// Parses and validates a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;

        debug!("Loaded configuration for {}", config.server_name);

        Ok(config)
    }

    /// Checks that timeouts are usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::EmptyServerName);
        }

        let durations = [
            ("listen.responseTimeout", self.listen.response_timeout),
            ("listen.rematchInterval", self.listen.rematch_interval),
            (
                "stateRegistry.stateReconciliationTimeout",
                self.state_registry.state_reconciliation_timeout,
            ),
            ("lock.holdTimeout", self.lock.hold_timeout),
            ("lock.requestTimeout", self.lock.request_timeout),
        ];

        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(key));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = HeraldConfig::default();

        assert_eq!(config.listen.response_timeout, Duration::from_millis(500));
        assert_eq!(config.listen.rematch_interval, Duration::from_secs(30));
        assert_eq!(config.listen.match_cooldown, Duration::from_secs(10));
        assert!(config.listen.shuffle_providers);
        assert_eq!(config.lock.hold_timeout, Duration::from_secs(1));
        assert_eq!(config.lock.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = HeraldConfig::from_toml_str(
            r#"
            serverName = "node-a"

            [listen]
            responseTimeout = 250
            shuffleProviders = false

            [stateRegistry]
            checkSumBuffer = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "node-a");
        assert_eq!(config.listen.response_timeout, Duration::from_millis(250));
        assert!(!config.listen.shuffle_providers);
        assert_eq!(config.listen.match_cooldown, DEFAULT_MATCH_COOLDOWN);
        assert_eq!(
            config.state_registry.check_sum_buffer,
            Duration::from_millis(20)
        );
        assert_eq!(config.lock, LockConfig::default());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = HeraldConfig::from_toml_str(
            r"
            [lock]
            requestTimeout = 0
            ",
        );

        assert_matches!(result, Err(ConfigError::ZeroDuration("lock.requestTimeout")));
    }

    #[test]
    fn test_empty_server_name_rejected() {
        let result = HeraldConfig::from_toml_str(r#"serverName = """#);

        assert_matches!(result, Err(ConfigError::EmptyServerName));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let result = HeraldConfig::from_toml_str("listen = 5");

        assert_matches!(result, Err(ConfigError::Parse(_)));
    }
}
