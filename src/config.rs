//! Control-plane configuration
//!
//! Timing knobs for the reconciler, the state poller, and the node watchdog.
//! All values arrive as duration strings (`"100ms"`, `"30s"`, `"5m"`) from the
//! CLI or the environment and are parsed by [`parse_duration`].

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the reconciliation control plane
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// How often observed engine state is refreshed into the registry
    pub cache_period: Duration,
    /// How often the reconciler walks all volumes
    pub reconcile_period: Duration,
    /// Grace period before a faulted nexus child is evicted and replaced
    pub faulted_child_wait_period: Duration,
    /// Upper bound on any single engine call to a node
    pub node_conn_timeout: Duration,
    /// Expected node heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a node is marked offline
    pub heartbeat_timeout: Duration,
    /// How long a target path may stay connecting before it is flagged
    pub path_connect_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(5);
        Self {
            cache_period: Duration::from_secs(30),
            reconcile_period: Duration::from_secs(30),
            faulted_child_wait_period: Duration::from_secs(10),
            node_conn_timeout: Duration::from_secs(1),
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 3,
            path_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ControlPlaneConfig {
    /// Build a config from duration strings, deriving the heartbeat timeout
    /// when none is given
    #[allow(clippy::too_many_arguments)]
    pub fn from_strs(
        cache_period: &str,
        reconcile_period: &str,
        faulted_child_wait_period: &str,
        node_conn_timeout: &str,
        heartbeat_interval: &str,
        heartbeat_timeout: Option<&str>,
        path_connect_timeout: &str,
    ) -> Result<Self> {
        let heartbeat_interval = parse_duration(heartbeat_interval)?;
        let heartbeat_timeout = match heartbeat_timeout {
            Some(s) => parse_duration(s)?,
            None => heartbeat_interval * 3,
        };
        Ok(Self {
            cache_period: parse_duration(cache_period)?,
            reconcile_period: parse_duration(reconcile_period)?,
            faulted_child_wait_period: parse_duration(faulted_child_wait_period)?,
            node_conn_timeout: parse_duration(node_conn_timeout)?,
            heartbeat_interval,
            heartbeat_timeout,
            path_connect_timeout: parse_duration(path_connect_timeout)?,
        })
    }
}

/// Parse a human duration string like "100ms", "30s", "5m", "1h"
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".into()));
    }

    // Find where the number ends and unit begins
    let mut num_end = 0;
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            num_end = i;
            break;
        }
        num_end = i + 1;
    }

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::DurationParse(format!("invalid number: {}", num_str)))?;

    let micros_per_unit: f64 = match unit_str.to_lowercase().as_str() {
        "us" | "µs" => 1.0,
        "ms" => 1_000.0,
        "" | "s" | "sec" | "secs" => 1_000_000.0,
        "m" | "min" | "mins" => 60.0 * 1_000_000.0,
        "h" | "hr" | "hrs" => 3600.0 * 1_000_000.0,
        _ => {
            return Err(Error::DurationParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok(Duration::from_micros((num * micros_per_unit) as u64))
}
