//! Runtime configuration for the operator
//!
//! Values come from CLI flags with environment fallbacks (see `main.rs`) and
//! are carried by the controller contexts.

use std::time::Duration;

/// Default interval between cluster resyncs (also the stale-IP sweep tick)
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on how long `ensure_created` waits for a node loop to boot
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect/probe timeout for workload API clients
pub const DEFAULT_WORKLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Operator-wide settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Interval between cluster reconciliations when nothing changes
    pub resync_interval: Duration,
    /// Upper bound for a per-cluster node loop to report booted
    pub boot_timeout: Duration,
    /// Connect and probe timeout for workload API clients
    pub workload_connect_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            workload_connect_timeout: DEFAULT_WORKLOAD_CONNECT_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    /// Build a config from second-granularity values, rejecting zero intervals
    pub fn from_secs(
        resync_secs: u64,
        boot_timeout_secs: u64,
        connect_timeout_secs: u64,
    ) -> Result<Self, crate::Error> {
        for (name, value) in [
            ("resync interval", resync_secs),
            ("boot timeout", boot_timeout_secs),
            ("workload connect timeout", connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(crate::Error::internal_with_context(
                    "config",
                    format!("{name} must be greater than zero"),
                ));
            }
        }

        Ok(Self {
            resync_interval: Duration::from_secs(resync_secs),
            boot_timeout: Duration::from_secs(boot_timeout_secs),
            workload_connect_timeout: Duration::from_secs(connect_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OperatorConfig::default();
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.boot_timeout, Duration::from_secs(30));
        assert_eq!(config.workload_connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(OperatorConfig::from_secs(0, 30, 5).is_err());
        assert!(OperatorConfig::from_secs(60, 0, 5).is_err());
        assert!(OperatorConfig::from_secs(60, 30, 0).is_err());
        assert_eq!(
            OperatorConfig::from_secs(60, 30, 5).expect("valid config"),
            OperatorConfig::default()
        );
    }
}
