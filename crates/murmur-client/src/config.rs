//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default taken from `murmur_shared::constants`, so an
//! engine can start with zero configuration.

use std::time::Duration;

use murmur_shared::constants::{
    BACKOFF_CAP_MS, BACKOFF_INITIAL_MS, BACKOFF_MULTIPLIER, FETCH_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS,
    INITIAL_FETCH_RETRIES, INITIAL_FETCH_RETRY_DELAY_MS, TRANSPORT_TIMEOUT_MS, TYPING_EXPIRY_MS,
    TYPING_QUIET_MS, USER_LIST_DEBOUNCE_MS,
};
use murmur_store::CacheLimits;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Interval between `last_seen_at` updates.
    /// Env: `MURMUR_HEARTBEAT_MS`
    pub heartbeat_interval: Duration,

    /// Draft inactivity after which the outbound typing signal is cleared.
    /// Env: `MURMUR_TYPING_QUIET_MS`
    pub typing_quiet: Duration,

    /// A peer's typing indicator is dropped after this long without a refresh.
    /// Env: `MURMUR_TYPING_EXPIRY_MS`
    pub typing_expiry: Duration,

    /// Env: `MURMUR_BACKOFF_INITIAL_MS`
    pub backoff_initial: Duration,
    /// Env: `MURMUR_BACKOFF_MULTIPLIER`
    pub backoff_multiplier: f64,
    /// Env: `MURMUR_BACKOFF_CAP_MS`
    pub backoff_cap: Duration,

    /// Bound on a single data fetch.
    /// Env: `MURMUR_FETCH_TIMEOUT_MS`
    pub fetch_timeout: Duration,

    /// Bound on a single write to the message store.
    /// Env: `MURMUR_TRANSPORT_TIMEOUT_MS`
    pub transport_timeout: Duration,

    /// Env: `MURMUR_INITIAL_FETCH_RETRIES`
    pub initial_fetch_retries: u32,
    /// Env: `MURMUR_INITIAL_FETCH_RETRY_DELAY_MS`
    pub initial_fetch_retry_delay: Duration,

    /// Env: `MURMUR_USER_LIST_DEBOUNCE_MS`
    pub user_list_debounce: Duration,

    /// Env: `MURMUR_CACHE_MAX_CONVERSATIONS`, `MURMUR_CACHE_MAX_MESSAGES`
    pub cache_limits: CacheLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            typing_quiet: Duration::from_millis(TYPING_QUIET_MS),
            typing_expiry: Duration::from_millis(TYPING_EXPIRY_MS),
            backoff_initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            backoff_cap: Duration::from_millis(BACKOFF_CAP_MS),
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS),
            transport_timeout: Duration::from_millis(TRANSPORT_TIMEOUT_MS),
            initial_fetch_retries: INITIAL_FETCH_RETRIES,
            initial_fetch_retry_delay: Duration::from_millis(INITIAL_FETCH_RETRY_DELAY_MS),
            user_list_debounce: Duration::from_millis(USER_LIST_DEBOUNCE_MS),
            cache_limits: CacheLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        read_millis(&lookup, "MURMUR_HEARTBEAT_MS", &mut config.heartbeat_interval);
        read_millis(&lookup, "MURMUR_TYPING_QUIET_MS", &mut config.typing_quiet);
        read_millis(&lookup, "MURMUR_TYPING_EXPIRY_MS", &mut config.typing_expiry);
        read_millis(&lookup, "MURMUR_BACKOFF_INITIAL_MS", &mut config.backoff_initial);
        read_millis(&lookup, "MURMUR_BACKOFF_CAP_MS", &mut config.backoff_cap);
        read_millis(&lookup, "MURMUR_FETCH_TIMEOUT_MS", &mut config.fetch_timeout);
        read_millis(&lookup, "MURMUR_TRANSPORT_TIMEOUT_MS", &mut config.transport_timeout);
        read_millis(
            &lookup,
            "MURMUR_INITIAL_FETCH_RETRY_DELAY_MS",
            &mut config.initial_fetch_retry_delay,
        );
        read_millis(&lookup, "MURMUR_USER_LIST_DEBOUNCE_MS", &mut config.user_list_debounce);

        if let Some(val) = lookup("MURMUR_BACKOFF_MULTIPLIER") {
            match val.parse::<f64>() {
                Ok(m) if m >= 1.0 && m.is_finite() => config.backoff_multiplier = m,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_BACKOFF_MULTIPLIER, using default"),
            }
        }

        read_count(&lookup, "MURMUR_INITIAL_FETCH_RETRIES", &mut config.initial_fetch_retries);
        read_count(
            &lookup,
            "MURMUR_CACHE_MAX_CONVERSATIONS",
            &mut config.cache_limits.max_conversations,
        );
        read_count(
            &lookup,
            "MURMUR_CACHE_MAX_MESSAGES",
            &mut config.cache_limits.max_messages_per_conversation,
        );

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn read_millis(lookup: &impl Fn(&str) -> Option<String>, name: &str, target: &mut Duration) {
    if let Some(val) = lookup(name) {
        // zero would panic `interval` and make the poll loops spin
        match val.parse::<u64>() {
            Ok(ms) if ms > 0 => *target = Duration::from_millis(ms),
            _ => tracing::warn!(var = name, value = %val, "Invalid duration, using default"),
        }
    }
}

fn read_count<T: std::str::FromStr + PartialOrd + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(val) = lookup(name) {
        match val.parse::<T>() {
            Ok(n) if n > T::default() => *target = n,
            _ => tracing::warn!(var = name, value = %val, "Invalid count, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_initial, Duration::from_millis(1000));
        assert_eq!(config.backoff_cap, Duration::from_millis(10_000));
        assert_eq!(config.initial_fetch_retries, 3);
        assert_eq!(config.typing_quiet, Duration::from_secs(3));
    }

    #[test]
    fn test_env_overrides() {
        let config = config_with(&[
            ("MURMUR_HEARTBEAT_MS", "500"),
            ("MURMUR_BACKOFF_MULTIPLIER", "2"),
            ("MURMUR_CACHE_MAX_MESSAGES", "10"),
        ]);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.cache_limits.max_messages_per_conversation, 10);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_with(&[
            ("MURMUR_FETCH_TIMEOUT_MS", "soon"),
            ("MURMUR_BACKOFF_MULTIPLIER", "0.5"),
            ("MURMUR_INITIAL_FETCH_RETRIES", "0"),
        ]);
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_zero_durations_keep_defaults() {
        let config = config_with(&[
            ("MURMUR_HEARTBEAT_MS", "0"),
            ("MURMUR_BACKOFF_INITIAL_MS", "0"),
            ("MURMUR_TYPING_EXPIRY_MS", "0"),
        ]);
        assert_eq!(config, EngineConfig::default());
        assert!(!config.heartbeat_interval.is_zero());
    }
}
