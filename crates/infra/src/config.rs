//! Orchestrator configuration loaded from the environment.

use std::time::Duration;

use tracing::warn;

/// Tunables for the build orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retry ceiling given to new jobs.
    pub max_retries: u32,
    /// Heartbeat age after which a RUNNING job counts as crashed.
    pub stale_after: Duration,
    /// How often a runner refreshes its heartbeat while a unit is in flight.
    pub heartbeat_interval: Duration,
    /// Lease length granted by a claim or heartbeat.
    pub lease_ttl: Duration,
    pub stream_poll_interval: Duration,
    /// Period of the background stale-job sweep (`None` = disabled).
    pub recovery_sweep_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stale_after: Duration::from_secs(180),
            heartbeat_interval: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(60),
            stream_poll_interval: Duration::from_millis(900),
            recovery_sweep_interval: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let max_retries = parse_or(&lookup, "STUDYFORGE_MAX_RETRIES", defaults.max_retries);
        let stale_after = parse_or(
            &lookup,
            "STUDYFORGE_STALE_AFTER_SECS",
            defaults.stale_after.as_secs(),
        );
        let heartbeat = parse_or(
            &lookup,
            "STUDYFORGE_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        );
        let lease = parse_or(
            &lookup,
            "STUDYFORGE_LEASE_TTL_SECS",
            defaults.lease_ttl.as_secs(),
        );
        let poll_ms = parse_or(
            &lookup,
            "STUDYFORGE_STREAM_POLL_MS",
            defaults.stream_poll_interval.as_millis() as u64,
        );
        let sweep = lookup("STUDYFORGE_RECOVERY_SWEEP_SECS").and_then(|raw| {
            match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    warn!(
                        key = "STUDYFORGE_RECOVERY_SWEEP_SECS",
                        value = %raw,
                        "invalid value, sweep disabled"
                    );
                    None
                }
            }
        });

        let mut config = Self {
            max_retries,
            stale_after: Duration::from_secs(stale_after),
            heartbeat_interval: Duration::from_secs(heartbeat.max(1)),
            lease_ttl: Duration::from_secs(lease.max(1)),
            stream_poll_interval: Duration::from_millis(poll_ms.max(10)),
            recovery_sweep_interval: sweep,
        };

        // A runner gets at least two heartbeats in before it reads as stale.
        if config.heartbeat_interval * 2 > config.stale_after {
            let clamped = (config.stale_after / 2).max(Duration::from_secs(1));
            warn!(
                heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
                stale_after_secs = config.stale_after.as_secs(),
                clamped_secs = clamped.as_secs(),
                "heartbeat interval too close to the stale threshold, clamping"
            );
            config.heartbeat_interval = clamped;
        }

        if config.lease_ttl <= config.heartbeat_interval {
            warn!(
                lease_ttl_secs = config.lease_ttl.as_secs(),
                heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
                "lease ttl must exceed heartbeat interval, using 4x heartbeat"
            );
            config.lease_ttl = config.heartbeat_interval * 4;
        }

        config
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_stream_poll_interval(mut self, interval: Duration) -> Self {
        self.stream_poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, heartbeat_interval: Duration, lease_ttl: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self.lease_ttl = lease_ttl;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "invalid value, using default");
                default
            }
        },
    }
}

/// Convert a std duration to a chrono one; out-of-range values become one year.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = OrchestratorConfig::from_lookup(|_| None);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stale_after, Duration::from_secs(180));
        assert_eq!(config.stream_poll_interval, Duration::from_millis(900));
        assert!(config.recovery_sweep_interval.is_none());
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("STUDYFORGE_MAX_RETRIES", "5"),
            ("STUDYFORGE_STALE_AFTER_SECS", "soon"),
            ("STUDYFORGE_RECOVERY_SWEEP_SECS", "30"),
        ]));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stale_after, Duration::from_secs(180));
        assert_eq!(config.recovery_sweep_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn lease_is_kept_longer_than_heartbeat() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("STUDYFORGE_HEARTBEAT_INTERVAL_SECS", "20"),
            ("STUDYFORGE_LEASE_TTL_SECS", "10"),
        ]));
        assert_eq!(config.lease_ttl, Duration::from_secs(80));
    }

    #[test]
    fn heartbeat_is_clamped_below_the_stale_threshold() {
        let config = OrchestratorConfig::from_lookup(lookup(&[(
            "STUDYFORGE_HEARTBEAT_INTERVAL_SECS",
            "300",
        )]));
        assert_eq!(config.stale_after, Duration::from_secs(180));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(90));
        assert!(config.heartbeat_interval * 2 <= config.stale_after);
        assert!(config.lease_ttl > config.heartbeat_interval);

        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("STUDYFORGE_STALE_AFTER_SECS", "60"),
            ("STUDYFORGE_HEARTBEAT_INTERVAL_SECS", "30"),
        ]));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }
}
