//! Router configuration
//!
//! Provides startup configuration, validation, and environment-based
//! overrides. The configuration is read once at startup and snapshotted
//! into every shard; changing it requires restarting the router.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RouterError, RouterResult};

/// SIP protocol timers (RFC 3261 defaults)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipTimers {
    /// T1: RTT estimate in milliseconds
    pub t1_ms: u64,
    /// T2: maximum retransmission interval for non-INVITE requests, in milliseconds
    pub t2_ms: u64,
    /// T4: maximum duration a message remains in the network, in milliseconds
    pub t4_ms: u64,
    /// Timer C: proxy INVITE transaction timeout, in seconds
    pub tc_secs: u64,
}

impl SipTimers {
    /// Validate timer relationships
    pub fn validate(&self) -> RouterResult<()> {
        if self.t1_ms == 0 {
            return Err(RouterError::Configuration("T1 must be positive".to_string()));
        }
        if self.t2_ms < self.t1_ms {
            return Err(RouterError::Configuration(
                "T2 must be greater than or equal to T1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            tc_secs: 180,
        }
    }
}

/// Router configuration, snapshotted into every shard at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Deployment-global identifier, mixed into generated call IDs
    pub global_id: String,
    /// Number of router shards
    pub shard_count: usize,
    /// Maximum live calls across all applications
    pub max_calls: usize,
    /// Round-trip deadline for synchronous work, in milliseconds
    pub sync_timeout_ms: u64,
    /// Maximum transaction duration; also the worker inactivity bound, in seconds
    pub transaction_timeout_secs: u64,
    /// Maximum dialog duration without a refresh, in seconds
    pub dialog_timeout_secs: u64,
    /// Hard ceiling on total call lifetime, in seconds
    pub max_dialog_time_secs: u64,
    /// SIP protocol timers
    pub timers: SipTimers,
}

impl RouterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> RouterResult<()> {
        if self.shard_count == 0 {
            return Err(RouterError::Configuration(
                "shard_count must be positive".to_string(),
            ));
        }
        if self.max_calls == 0 {
            return Err(RouterError::Configuration(
                "max_calls must be positive".to_string(),
            ));
        }
        if self.sync_timeout_ms == 0 {
            return Err(RouterError::Configuration(
                "sync_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_dialog_time_secs < self.dialog_timeout_secs {
            return Err(RouterError::Configuration(
                "max_dialog_time must be at least dialog_timeout".to_string(),
            ));
        }
        self.timers.validate()
    }

    /// Load configuration from environment variables, starting from defaults
    pub fn load_from_env() -> RouterResult<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SIP_ROUTER_GLOBAL_ID") {
            config.global_id = val;
        }
        if let Ok(val) = std::env::var("SIP_ROUTER_SHARDS") {
            config.shard_count = parse_env("SIP_ROUTER_SHARDS", &val)?;
        }
        if let Ok(val) = std::env::var("SIP_ROUTER_MAX_CALLS") {
            config.max_calls = parse_env("SIP_ROUTER_MAX_CALLS", &val)?;
        }
        if let Ok(val) = std::env::var("SIP_ROUTER_SYNC_TIMEOUT_MS") {
            config.sync_timeout_ms = parse_env("SIP_ROUTER_SYNC_TIMEOUT_MS", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Synchronous round-trip deadline
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Transaction timeout as a duration
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    /// Dialog timeout as a duration
    pub fn dialog_timeout(&self) -> Duration {
        Duration::from_secs(self.dialog_timeout_secs)
    }

    /// Hard call lifetime ceiling as a duration
    pub fn max_dialog_time(&self) -> Duration {
        Duration::from_secs(self.max_dialog_time_secs)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            global_id: uuid::Uuid::new_v4().simple().to_string(),
            shard_count: num_cpus::get().max(1),
            max_calls: 100_000,
            sync_timeout_ms: 5_000,
            transaction_timeout_secs: 900,
            dialog_timeout_secs: 1_800,
            max_dialog_time_secs: 86_400,
            timers: SipTimers::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> RouterResult<T> {
    value
        .parse()
        .map_err(|_| RouterError::Configuration(format!("{} is not a valid value for {}", value, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.shard_count >= 1);
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let config = RouterConfig {
            shard_count: 0,
            ..RouterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RouterError::Configuration(_))
        ));
    }

    #[test]
    fn test_timer_ordering_enforced() {
        let timers = SipTimers {
            t1_ms: 1_000,
            t2_ms: 500,
            ..SipTimers::default()
        };
        assert!(timers.validate().is_err());
    }

    #[test]
    fn test_global_ids_differ_between_runs() {
        let a = RouterConfig::default();
        let b = RouterConfig::default();
        assert_ne!(a.global_id, b.global_id);
    }
}
