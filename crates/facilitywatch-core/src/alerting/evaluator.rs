//! Threshold evaluation over a trailing reading window
//!
//! The evaluator is pure: it never touches a store, so every decision about
//! windowing and threshold semantics can be tested in isolation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{AlertRule, SensorReading};

/// Outcome of checking one rule against one sensor's window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EvaluationResult {
    /// Whether the condition held for the whole required duration
    pub satisfied: bool,
    /// Most recent in-window sample, stored on the alert
    pub triggering_value: Option<f64>,
    /// Timestamp of that sample
    pub triggering_timestamp: Option<DateTime<Utc>>,
}

impl EvaluationResult {
    fn unsatisfied() -> Self {
        Self::default()
    }
}

/// Decides whether a rule's condition has been continuously satisfied
#[derive(Debug, Clone, Copy)]
pub struct ThresholdEvaluator {
    eq_tolerance: f64,
}

impl Default for ThresholdEvaluator {
    fn default() -> Self {
        Self::new(0.005)
    }
}

impl ThresholdEvaluator {
    /// Create an evaluator with the given absolute tolerance for `eq`
    pub fn new(eq_tolerance: f64) -> Self {
        Self { eq_tolerance }
    }

    /// Start of the rule's window when evaluated at `now`
    pub fn window_start(rule: &AlertRule, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::minutes(i64::from(rule.duration_minutes.max(0)))
    }

    /// Evaluate `rule` against `readings`, which must be ascending by
    /// timestamp.
    ///
    /// The window is the reading in force at `now - duration` followed by
    /// every later reading up to `now`. The rule is satisfied only if such an
    /// opening reading exists and every sample in the window matches; one
    /// miss anywhere resets satisfaction.
    pub fn evaluate(
        &self,
        rule: &AlertRule,
        readings: &[SensorReading],
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        let start = Self::window_start(rule, now);

        let Some(window) = covering_window(readings, start, now) else {
            return EvaluationResult::unsatisfied();
        };

        if !window
            .iter()
            .all(|reading| rule.check(reading.value, self.eq_tolerance))
        {
            return EvaluationResult::unsatisfied();
        }

        let latest = window.last();
        EvaluationResult {
            satisfied: true,
            triggering_value: latest.map(|r| r.value),
            triggering_timestamp: latest.map(|r| r.timestamp),
        }
    }

    /// Whether the condition has been absent for the whole of `grace`.
    ///
    /// Used by the auto-clear policy: the trailing `grace` window must be
    /// fully covered by readings and none of them may satisfy the rule.
    pub fn evaluate_cleared(
        &self,
        rule: &AlertRule,
        readings: &[SensorReading],
        grace: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match covering_window(readings, now - grace, now) {
            Some(window) => window
                .iter()
                .all(|reading| !rule.check(reading.value, self.eq_tolerance)),
            None => false,
        }
    }
}

/// Slice from the last reading at or before `start` through the last
/// reading at or before `now`. `None` when nothing covers `start`.
fn covering_window(
    readings: &[SensorReading],
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<&[SensorReading]> {
    debug_assert!(
        readings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "readings must be ascending by timestamp"
    );

    let in_force = &readings[..readings.partition_point(|r| r.timestamp <= now)];
    let opening = in_force.partition_point(|r| r.timestamp <= start).checked_sub(1)?;

    Some(&in_force[opening..])
}
