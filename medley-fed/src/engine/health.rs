//! Per-process engine health and suspension
//!
//! An engine that keeps failing is suspended for a while instead of being
//! dispatched (and charged a rate-limit token) on every query. Suspension
//! doubles per further failure and is capped.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Suspension policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before suspension
    pub failure_threshold: u32,
    pub base_suspension_secs: u64,
    pub max_suspension_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_suspension_secs: 30,
            max_suspension_secs: 300,
        }
    }
}

#[derive(Debug, Default)]
struct EngineHealth {
    consecutive_failures: u32,
    suspended_until: Option<Instant>,
}

/// Tracks consecutive failures per source
#[derive(Debug)]
pub struct HealthTracker {
    threshold: u32,
    base: Duration,
    max: Duration,
    states: Mutex<HashMap<String, EngineHealth>>,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_durations(
            config.failure_threshold,
            Duration::from_secs(config.base_suspension_secs),
            Duration::from_secs(config.max_suspension_secs),
        )
    }

    pub fn with_durations(threshold: u32, base: Duration, max: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            base,
            max: max.max(base),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining suspension, if the source is currently suspended
    pub fn suspended_for(&self, source: &str) -> Option<Duration> {
        let states = self.states.lock().ok()?;
        let until = states.get(source)?.suspended_until?;
        until.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }

    pub fn record_success(&self, source: &str) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(source) {
                if state.consecutive_failures >= self.threshold {
                    info!(source = %source, "Engine recovered, suspension lifted");
                }
                *state = EngineHealth::default();
            }
        }
    }

    pub fn record_failure(&self, source: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(source.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.consecutive_failures >= self.threshold {
            let extra = (state.consecutive_failures - self.threshold).min(16);
            let suspension = self.base.saturating_mul(1u32 << extra).min(self.max);
            state.suspended_until = Some(Instant::now() + suspension);
            warn!(
                source = %source,
                failures = state.consecutive_failures,
                suspension_ms = suspension.as_millis() as u64,
                "Engine suspended after consecutive failures"
            );
        }
    }
}
