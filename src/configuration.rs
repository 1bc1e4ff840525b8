//! Config for the league behaviors
//!
//! This module provides configuration options for controlling how the league scores peers,
//! plays matches and talks to remote agents. Timeouts and the concurrency cap live in
//! [`Constraints`](crate::constraints::Constraints).
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set the value to `"true"` to enable one.
//! Unparsable values fall back to the default.
//!
//! - `LEAGUE_VERBOSE`: Print match results and standings to stdout (default: `true`)
//! - `LEAGUE_LOG`: Enable logging to a file (default: `false`)
//! - `LEAGUE_EJECTION_THRESHOLD`: Composite score at which a peer is ejected (default: `3`)
//! - `LEAGUE_EJECTION_POLICY`: `round_boundary` or `immediate` (default: `round_boundary`)
//! - `LEAGUE_TOTAL_ROUNDS`: Rounds per match (default: `5`)
//! - `LEAGUE_MAX_RETRIES`: Retries of a transient transport failure (default: `2`)
//! - `LEAGUE_FAILURE_THRESHOLD`: Consecutive failures opening a circuit (default: `5`)
//! - `LEAGUE_CIRCUIT_COOLDOWN_MS`: Time a circuit stays open (default: `5000`)

use std::env;
use std::time::Duration;

use crate::referee::EjectionPolicy;
use crate::standings::PointsTable;

/// Configuration for league behaviors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) ejection_threshold: u32,
    pub(crate) ejection_policy: EjectionPolicy,
    pub(crate) total_rounds: u32,
    pub(crate) points: PointsTable,
    pub(crate) anomaly_sigma: f64,
    pub(crate) anomaly_floor: Duration,
    pub(crate) anomaly_min_samples: usize,
    pub(crate) latency_window: usize,
    pub(crate) max_retries: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_max: Duration,
    pub(crate) failure_threshold: u32,
    pub(crate) circuit_cooldown: Duration,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match results and standings are printed to stdout.
    /// - Logging to file is disabled.
    /// - Peers are ejected at a composite score of 3, and an ejection ends the match at the
    ///   next round boundary.
    /// - Matches are 5 rounds long; a win is worth 3 points, a draw 1.
    /// - A latency is anomalous beyond 3σ (and 50 ms) of the last 32, after 5 samples.
    /// - Transient transport failures are retried twice with a 50 ms exponential backoff
    ///   capped at 1 s; 5 consecutive failures open a circuit for 5 s.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            ejection_threshold: 3,
            ejection_policy: EjectionPolicy::RoundBoundary,
            total_rounds: 5,
            points: PointsTable::default(),
            anomaly_sigma: 3.0,
            anomaly_floor: Duration::from_millis(50),
            anomaly_min_samples: 5,
            latency_window: 32,
            max_retries: 2,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
            failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(5),
        }
    }

    /// Create configuration from environment variables, see the [module documentation](self).
    ///
    /// Any variable that is unset or does not parse keeps its default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_num<T: std::str::FromStr>(var: &str, default: T) -> T {
            env::var(var)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::new();
        let ejection_policy = match env::var("LEAGUE_EJECTION_POLICY") {
            Ok(val) if val.eq_ignore_ascii_case("immediate") => EjectionPolicy::Immediate,
            _ => defaults.ejection_policy,
        };

        Self {
            verbose: get_env_flag("LEAGUE_VERBOSE", defaults.verbose),
            log: get_env_flag("LEAGUE_LOG", defaults.log),
            ejection_threshold: get_env_num("LEAGUE_EJECTION_THRESHOLD", defaults.ejection_threshold),
            ejection_policy,
            total_rounds: get_env_num("LEAGUE_TOTAL_ROUNDS", defaults.total_rounds),
            max_retries: get_env_num("LEAGUE_MAX_RETRIES", defaults.max_retries),
            failure_threshold: get_env_num("LEAGUE_FAILURE_THRESHOLD", defaults.failure_threshold),
            circuit_cooldown: Duration::from_millis(get_env_num(
                "LEAGUE_CIRCUIT_COOLDOWN_MS",
                defaults.circuit_cooldown.as_millis() as u64,
            )),
            ..defaults
        }
    }

    /// Enable or disable progress printing.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Composite score at which a peer is ejected. Clamped to at least 1.
    pub fn with_ejection_threshold(mut self, value: u32) -> Self {
        self.ejection_threshold = value.max(1);
        self
    }

    /// When an ejection ends a running match.
    pub fn with_ejection_policy(mut self, value: EjectionPolicy) -> Self {
        self.ejection_policy = value;
        self
    }

    /// Rounds per match. Clamped to at least 1.
    pub fn with_total_rounds(mut self, value: u32) -> Self {
        self.total_rounds = value.max(1);
        self
    }

    /// Points awarded per win, draw and loss.
    pub fn with_points(mut self, value: PointsTable) -> Self {
        self.points = value;
        self
    }

    /// Timing anomaly tuning: deviation in standard deviations, absolute floor, samples needed
    /// and window size.
    pub fn with_anomaly_detection(
        mut self,
        sigma: f64,
        floor: Duration,
        min_samples: usize,
        window: usize,
    ) -> Self {
        self.anomaly_sigma = sigma;
        self.anomaly_floor = floor;
        self.anomaly_min_samples = min_samples;
        self.latency_window = window.max(min_samples);
        self
    }

    /// Retry policy for transient transport failures.
    pub fn with_retries(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    /// Circuit breaker tuning.
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self.circuit_cooldown = cooldown;
        self
    }

    /// Rounds per match.
    pub fn total_rounds(&self) -> u32 {
        self.total_rounds
    }

    /// Ejection policy in use.
    pub fn ejection_policy(&self) -> EjectionPolicy {
        self.ejection_policy
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod configuration_tests {
    use super::*;

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = Configuration::new()
            .with_total_rounds(0)
            .with_ejection_threshold(0)
            .with_circuit_breaker(0, Duration::from_millis(10))
            .with_retries(1, Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(config.total_rounds, 1);
        assert_eq!(config.ejection_threshold, 1);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.backoff_max, Duration::from_millis(100));
    }

    #[test]
    fn defaults() {
        let config = Configuration::default();
        assert_eq!(config.ejection_threshold, 3);
        assert_eq!(config.ejection_policy, EjectionPolicy::RoundBoundary);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.points, PointsTable::default());
    }
}
