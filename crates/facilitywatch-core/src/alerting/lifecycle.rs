//! Alert lifecycle manager
//!
//! The only writer of alert state. Runs evaluation cycles, owns the status
//! state machine and announces every change through the notification dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::evaluator::{EvaluationResult, ThresholdEvaluator};
use super::matcher::SensorIndex;
use super::notifier::{NotificationDispatcher, NotificationSink};
use super::repository::{AlertStore, InsertOutcome, ReadingStore, RuleRepository, SensorDirectory};
use crate::config::{AlertingConfig, MAX_GRACE_MINUTES};
use crate::error::{Error, Result};
use crate::models::{
    Alert, AlertAcknowledgment, AlertFilter, AlertInput, AlertNotification, AlertPage, AlertRule,
    AlertRuleInput, AlertRuleUpdate, AlertStatus, Sensor, SensorReading, WorkOrder,
    WorkOrderInput, WorkOrderType,
};

/// Counters for one evaluation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Enabled rules loaded for the tenant
    pub rules_evaluated: usize,
    /// (rule, sensor) pairs checked
    pub pairs_evaluated: usize,
    pub alerts_created: usize,
    /// Live alerts whose triggered value was refreshed
    pub alerts_refreshed: usize,
    pub alerts_auto_resolved: usize,
    /// Pairs skipped because their readings could not be fetched
    pub transient_failures: usize,
    /// Alert writes that failed and were skipped
    pub write_failures: usize,
}

/// A work order together with the alert it was spawned from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkOrderSpawn {
    pub alert: Alert,
    pub work_order: WorkOrder,
}

/// What happened to one (asset, rule) pair whose condition held
enum Applied {
    Created,
    Refreshed,
    Unchanged,
}

/// Evaluation outcomes of every sensor of one asset under one rule
struct AssetOutcome<'a> {
    rule: &'a AlertRule,
    asset_id: Uuid,
    satisfied: Option<(EvaluationResult, &'a Sensor)>,
    cleared: bool,
    failed: bool,
}

/// Owns alert state and runs evaluation cycles
pub struct AlertLifecycleManager {
    rules: Arc<dyn RuleRepository>,
    readings: Arc<dyn ReadingStore>,
    sensors: Arc<dyn SensorDirectory>,
    alerts: Arc<dyn AlertStore>,
    notifier: NotificationDispatcher,
    evaluator: ThresholdEvaluator,
    settings: AlertingConfig,
    tenant_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AlertLifecycleManager {
    /// Create a manager over separate collaborators
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        readings: Arc<dyn ReadingStore>,
        sensors: Arc<dyn SensorDirectory>,
        alerts: Arc<dyn AlertStore>,
        sink: Arc<dyn NotificationSink>,
        settings: AlertingConfig,
    ) -> Self {
        Self {
            rules,
            readings,
            sensors,
            alerts,
            notifier: NotificationDispatcher::new(
                sink,
                settings.notification_timeout,
                settings.notification_queue,
            ),
            evaluator: ThresholdEvaluator::new(settings.eq_tolerance),
            settings,
            tenant_locks: DashMap::new(),
        }
    }

    /// Create a manager over one store implementing every seam
    pub fn with_store<S>(store: Arc<S>, sink: Arc<dyn NotificationSink>, settings: AlertingConfig) -> Self
    where
        S: RuleRepository + ReadingStore + SensorDirectory + AlertStore + 'static,
    {
        Self::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            sink,
            settings,
        )
    }

    /// Engine settings in effect
    pub fn settings(&self) -> &AlertingConfig {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate every enabled rule of a tenant against current readings
    pub async fn run_evaluation_cycle(&self, tenant_id: Uuid) -> Result<CycleReport> {
        self.run_evaluation_cycle_at(tenant_id, Utc::now()).await
    }

    /// Evaluate every enabled rule of a tenant as of `now`
    #[instrument(skip_all, fields(%tenant_id))]
    pub async fn run_evaluation_cycle_at(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        let started = Instant::now();

        let rules = self.rules.list_enabled_rules(tenant_id).await?;
        let index = SensorIndex::new(self.sensors.list_sensors(tenant_id).await?);

        let mut report = CycleReport {
            rules_evaluated: rules.len(),
            ..CycleReport::default()
        };

        let pairs: Vec<(&AlertRule, &Sensor)> = rules
            .iter()
            .flat_map(|rule| index.matching(rule).into_iter().map(move |sensor| (rule, sensor)))
            .collect();
        report.pairs_evaluated = pairs.len();

        // Collected first so the stream owns concrete futures instead of a
        // closure over borrowed pairs, which is not Send for every lifetime
        let fetches: Vec<_> = pairs
            .into_iter()
            .map(|(rule, sensor)| async move {
                let window = self.fetch_window(rule, sensor, now).await;
                (rule, sensor, window)
            })
            .collect();

        let windows: Vec<(&AlertRule, &Sensor, Result<Vec<SensorReading>>)> = stream::iter(fetches)
            .buffer_unordered(self.settings.max_concurrent_fetches.max(1))
            .collect()
            .await;

        let mut outcomes: BTreeMap<(Uuid, Uuid), AssetOutcome<'_>> = BTreeMap::new();
        for (rule, sensor, window) in windows {
            let outcome = outcomes
                .entry((sensor.asset_id, rule.id))
                .or_insert_with(|| AssetOutcome {
                    rule,
                    asset_id: sensor.asset_id,
                    satisfied: None,
                    cleared: true,
                    failed: false,
                });

            let readings = match window {
                Ok(readings) => readings,
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        sensor_id = %sensor.id,
                        error = %e,
                        "Skipping rule evaluation"
                    );
                    report.transient_failures += 1;
                    outcome.failed = true;
                    continue;
                }
            };

            let result = self.evaluator.evaluate(rule, &readings, now);
            if result.satisfied {
                let newer = outcome.satisfied.map_or(true, |(best, _)| {
                    result.triggering_timestamp > best.triggering_timestamp
                });
                if newer {
                    outcome.satisfied = Some((result, sensor));
                }
            } else if self.settings.auto_clear.enabled {
                outcome.cleared &= self.evaluator.evaluate_cleared(
                    rule,
                    &readings,
                    self.grace(),
                    now,
                );
            }
        }

        for outcome in outcomes.into_values() {
            if let Some((result, sensor)) = outcome.satisfied {
                match self.apply_satisfied(outcome.rule, sensor, result, now).await {
                    Ok(Applied::Created) => report.alerts_created += 1,
                    Ok(Applied::Refreshed) => report.alerts_refreshed += 1,
                    Ok(Applied::Unchanged) => {}
                    Err(e) => {
                        warn!(rule_id = %outcome.rule.id, asset_id = %outcome.asset_id, error = %e, "Failed to record alert");
                        report.write_failures += 1;
                    }
                }
            } else if self.settings.auto_clear.enabled && outcome.cleared && !outcome.failed {
                match self.auto_resolve(outcome.rule, outcome.asset_id, now).await {
                    Ok(true) => report.alerts_auto_resolved += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(rule_id = %outcome.rule.id, asset_id = %outcome.asset_id, error = %e, "Failed to auto-resolve alert");
                        report.write_failures += 1;
                    }
                }
            }
        }

        counter!("facilitywatch_evaluation_cycles_total").increment(1);
        counter!("facilitywatch_alerts_created_total").increment(report.alerts_created as u64);
        counter!("facilitywatch_transient_failures_total")
            .increment(report.transient_failures as u64);
        histogram!("facilitywatch_evaluation_cycle_seconds")
            .record(started.elapsed().as_secs_f64());

        if report.alerts_created > 0 || report.transient_failures > 0 || report.write_failures > 0 {
            info!(?report, "Evaluation cycle finished");
        } else {
            debug!(?report, "Evaluation cycle finished");
        }

        Ok(report)
    }

    fn tenant_lock(&self, tenant_id: Uuid) -> Arc<Mutex<()>> {
        self.tenant_locks.entry(tenant_id).or_default().clone()
    }

    fn grace(&self) -> Duration {
        Duration::minutes(self.settings.auto_clear.grace_minutes.clamp(0, MAX_GRACE_MINUTES))
    }

    /// Readings covering the rule's window (and the auto-clear grace window
    /// when enabled), opening with the sample in force at its start
    async fn fetch_window(
        &self,
        rule: &AlertRule,
        sensor: &Sensor,
        now: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        let mut start = ThresholdEvaluator::window_start(rule, now);
        if self.settings.auto_clear.enabled {
            start = start.min(now - self.grace());
        }

        let fetch = async {
            let anchor = self.readings.get_reading_at_or_before(sensor.id, start).await?;
            let mut readings = self.readings.get_readings(sensor.id, start).await?;

            if let Some(anchor) = anchor {
                // A sample exactly at `start` is returned by both queries
                if readings.first().map_or(true, |r| r.timestamp > anchor.timestamp) {
                    readings.insert(0, anchor);
                }
            }
            Ok::<_, Error>(readings)
        };

        match tokio::time::timeout(self.settings.reading_timeout, fetch).await {
            Ok(Ok(readings)) => Ok(readings),
            Ok(Err(e)) => Err(Error::transient(format!(
                "reading fetch for sensor {} failed: {e}",
                sensor.id
            ))),
            Err(_) => Err(Error::transient(format!(
                "reading fetch for sensor {} timed out after {:?}",
                sensor.id, self.settings.reading_timeout
            ))),
        }
    }

    async fn apply_satisfied(
        &self,
        rule: &AlertRule,
        sensor: &Sensor,
        result: EvaluationResult,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let mut alert = Alert::open(
            rule.tenant_id,
            sensor.asset_id,
            rule.severity,
            rule.describe_condition(),
            now,
        );
        alert.alert_rule_id = Some(rule.id);
        alert.sensor_id = Some(sensor.id);
        alert.triggered_value = result.triggering_value;
        alert.description = Some(match result.triggering_value {
            Some(value) => format!(
                "{} on {} reported {value} {} ({})",
                sensor.name,
                sensor.asset_name,
                sensor.unit,
                rule.display_name()
            ),
            None => format!("{} on {} ({})", sensor.name, sensor.asset_name, rule.display_name()),
        });

        match self.alerts.insert_alert(&alert).await? {
            InsertOutcome::Created => {
                info!(
                    alert_id = %alert.id,
                    rule_id = %rule.id,
                    asset_id = %alert.asset_id,
                    value = ?alert.triggered_value,
                    severity = %alert.severity,
                    "Alert triggered"
                );
                self.notify(alert.tenant_id, AlertNotification::created(&alert));
                Ok(Applied::Created)
            }
            InsertOutcome::Duplicate(mut existing) => {
                if !self.settings.refresh_triggered_value
                    || existing.triggered_value == result.triggering_value
                {
                    return Ok(Applied::Unchanged);
                }

                let expected = existing.status;
                existing.triggered_value = result.triggering_value;
                existing.updated_at = now;

                // Losing the race to a manual transition leaves the alert as is
                if !self.alerts.update_alert(&existing, expected).await? {
                    return Ok(Applied::Unchanged);
                }

                debug!(alert_id = %existing.id, value = ?existing.triggered_value, "Refreshed live alert");
                self.notify(existing.tenant_id, AlertNotification::updated(&existing));
                Ok(Applied::Refreshed)
            }
        }
    }

    async fn auto_resolve(&self, rule: &AlertRule, asset_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut alert) = self
            .alerts
            .find_live_alert(rule.tenant_id, asset_id, rule.id)
            .await?
        else {
            return Ok(false);
        };

        let expected = alert.status;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = None;
        alert.resolution_notes = Some(append_note(
            alert.resolution_notes.take(),
            &format!(
                "Auto-resolved: condition absent for {} minutes",
                self.settings.auto_clear.grace_minutes
            ),
        ));
        alert.updated_at = now;

        if !self.alerts.update_alert(&alert, expected).await? {
            return Ok(false);
        }

        info!(alert_id = %alert.id, rule_id = %rule.id, "Alert auto-resolved");
        counter!("facilitywatch_alert_transitions_total", "to" => "resolved").increment(1);
        self.notify(alert.tenant_id, AlertNotification::updated(&alert));
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Acknowledge an open alert
    pub async fn acknowledge(
        &self,
        tenant_id: Uuid,
        alert_id: Uuid,
        user_id: Uuid,
        note: Option<String>,
    ) -> Result<Alert> {
        let mut alert = self.load_alert(tenant_id, alert_id).await?;
        ensure_transition(&alert, AlertStatus::Acknowledged)?;

        let now = Utc::now();
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.acknowledged_by = Some(user_id);
        alert.updated_at = now;

        let ack = AlertAcknowledgment {
            id: Uuid::new_v4(),
            alert_id,
            user_id,
            acknowledged_at: now,
            note,
        };

        if !self.alerts.acknowledge(&alert, &ack).await? {
            return Err(self.lost_race(tenant_id, alert_id, AlertStatus::Acknowledged).await);
        }

        self.transitioned(&alert);
        Ok(alert)
    }

    /// Resolve a live alert
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        alert_id: Uuid,
        user_id: Option<Uuid>,
        notes: Option<String>,
    ) -> Result<Alert> {
        let mut alert = self.load_alert(tenant_id, alert_id).await?;
        ensure_transition(&alert, AlertStatus::Resolved)?;

        let now = Utc::now();
        let expected = alert.status;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = user_id;
        if notes.is_some() {
            alert.resolution_notes = notes;
        }
        alert.updated_at = now;

        if !self.alerts.update_alert(&alert, expected).await? {
            return Err(self.lost_race(tenant_id, alert_id, AlertStatus::Resolved).await);
        }

        self.transitioned(&alert);
        Ok(alert)
    }

    /// Close an alert that has left the open state
    pub async fn close(&self, tenant_id: Uuid, alert_id: Uuid, note: Option<String>) -> Result<Alert> {
        let mut alert = self.load_alert(tenant_id, alert_id).await?;
        ensure_transition(&alert, AlertStatus::Closed)?;

        let expected = alert.status;
        alert.status = AlertStatus::Closed;
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            alert.resolution_notes = Some(append_note(
                alert.resolution_notes.take(),
                &format!("Closed: {note}"),
            ));
        }
        alert.updated_at = Utc::now();

        if !self.alerts.update_alert(&alert, expected).await? {
            return Err(self.lost_race(tenant_id, alert_id, AlertStatus::Closed).await);
        }

        self.transitioned(&alert);
        Ok(alert)
    }

    /// Create a work order from an alert and move the alert to in progress
    pub async fn spawn_work_order(
        &self,
        tenant_id: Uuid,
        alert_id: Uuid,
        user_id: Uuid,
        input: WorkOrderInput,
    ) -> Result<WorkOrderSpawn> {
        let mut alert = self.load_alert(tenant_id, alert_id).await?;
        if !alert.status.is_live() {
            return Err(Error::transition(alert.status, AlertStatus::InProgress));
        }

        let now = Utc::now();
        let expected = alert.status;
        alert.status = AlertStatus::InProgress;
        alert.updated_at = now;

        let work_order = WorkOrder {
            id: Uuid::new_v4(),
            tenant_id,
            asset_id: alert.asset_id,
            alert_id: Some(alert.id),
            title: input
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Alert: {}", alert.title)),
            description: Some(input.description.unwrap_or_else(|| {
                format!(
                    "Work order created from alert: {}",
                    alert.description.as_deref().unwrap_or(&alert.title)
                )
            })),
            work_order_type: WorkOrderType::Reactive,
            priority: input.priority,
            status: "open".to_string(),
            created_by: user_id,
            created_at: now,
        };

        if !self
            .alerts
            .spawn_work_order(&alert, expected, &work_order)
            .await?
        {
            return Err(self.lost_race(tenant_id, alert_id, AlertStatus::InProgress).await);
        }

        info!(alert_id = %alert.id, work_order_id = %work_order.id, "Work order spawned from alert");
        if expected != AlertStatus::InProgress {
            self.transitioned(&alert);
        }

        Ok(WorkOrderSpawn { alert, work_order })
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Create a manual alert; manual alerts are never deduplicated
    pub async fn create_alert(&self, tenant_id: Uuid, input: AlertInput) -> Result<Alert> {
        if input.title.trim().is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        self.sensors
            .get_asset(tenant_id, input.asset_id)
            .await?
            .ok_or_else(|| Error::not_found("Asset", input.asset_id))?;

        let mut alert = Alert::open(tenant_id, input.asset_id, input.severity, input.title, Utc::now());
        alert.description = input.description;

        self.alerts.insert_alert(&alert).await?;

        info!(alert_id = %alert.id, asset_id = %alert.asset_id, "Manual alert created");
        self.notify(tenant_id, AlertNotification::created(&alert));
        Ok(alert)
    }

    /// Validate and store a rule
    pub async fn create_rule(&self, tenant_id: Uuid, input: AlertRuleInput) -> Result<AlertRule> {
        let rule = input.into_rule(tenant_id)?;
        self.ensure_rule_asset(&rule).await?;

        self.rules.insert_rule(&rule).await?;
        info!(rule_id = %rule.id, rule = %rule.display_name(), "Alert rule created");
        Ok(rule)
    }

    /// Fetch a rule of the tenant
    pub async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<AlertRule> {
        self.rules
            .get_rule(tenant_id, rule_id)
            .await?
            .ok_or_else(|| Error::not_found("Alert rule", rule_id))
    }

    /// All rules of the tenant
    pub async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>> {
        self.rules.list_rules(tenant_id).await
    }

    /// Change fields of a rule, validating the result as on creation.
    ///
    /// Live alerts the rule already raised are left as they are.
    pub async fn update_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        update: AlertRuleUpdate,
    ) -> Result<AlertRule> {
        let current = self.get_rule(tenant_id, rule_id).await?;
        let rule = update.apply(&current)?;
        self.ensure_rule_asset(&rule).await?;

        if !self.rules.update_rule(&rule).await? {
            return Err(Error::not_found("Alert rule", rule_id));
        }
        info!(rule_id = %rule.id, rule = %rule.display_name(), enabled = rule.enabled, "Alert rule updated");
        Ok(rule)
    }

    /// Delete a rule; alerts it raised keep their history
    pub async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<()> {
        if !self.rules.delete_rule(tenant_id, rule_id).await? {
            return Err(Error::not_found("Alert rule", rule_id));
        }
        info!(%rule_id, "Alert rule deleted");
        Ok(())
    }

    /// Fetch an alert of the tenant
    pub async fn get_alert(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Alert> {
        self.load_alert(tenant_id, alert_id).await
    }

    /// One page of the tenant's alerts matching `filter`
    pub async fn list_alerts(&self, tenant_id: Uuid, filter: &AlertFilter) -> Result<AlertPage> {
        self.alerts.list_alerts(tenant_id, filter).await
    }

    /// Acknowledgment history of an alert
    pub async fn list_acknowledgments(
        &self,
        tenant_id: Uuid,
        alert_id: Uuid,
    ) -> Result<Vec<AlertAcknowledgment>> {
        self.load_alert(tenant_id, alert_id).await?;
        self.alerts.list_acknowledgments(alert_id).await
    }

    /// Work orders spawned from an alert
    pub async fn list_work_orders(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Vec<WorkOrder>> {
        self.load_alert(tenant_id, alert_id).await?;
        self.alerts.list_work_orders(alert_id).await
    }

    /// Tenants with at least one enabled rule
    pub async fn active_tenants(&self) -> Result<Vec<Uuid>> {
        self.rules.list_active_tenants().await
    }

    /// Wait until every event announced so far was delivered or given up on
    pub async fn flush_notifications(&self) {
        self.notifier.flush().await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn ensure_rule_asset(&self, rule: &AlertRule) -> Result<()> {
        if let Some(asset_id) = rule.asset_id {
            self.sensors
                .get_asset(rule.tenant_id, asset_id)
                .await?
                .ok_or_else(|| Error::not_found("Asset", asset_id))?;
        }
        Ok(())
    }

    async fn load_alert(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Alert> {
        self.alerts
            .get_alert(tenant_id, alert_id)
            .await?
            .ok_or_else(|| Error::not_found("Alert", alert_id))
    }

    /// Error for a compare-and-set that found a different status
    async fn lost_race(&self, tenant_id: Uuid, alert_id: Uuid, requested: AlertStatus) -> Error {
        match self.load_alert(tenant_id, alert_id).await {
            Ok(current) => Error::transition(current.status, requested),
            Err(e) => e,
        }
    }

    fn transitioned(&self, alert: &Alert) {
        info!(alert_id = %alert.id, status = %alert.status, "Alert status changed");
        counter!("facilitywatch_alert_transitions_total", "to" => alert.status.as_str())
            .increment(1);
        self.notify(alert.tenant_id, AlertNotification::updated(alert));
    }

    /// Queue an event; delivery happens off the caller's path
    fn notify(&self, tenant_id: Uuid, notification: AlertNotification) {
        self.notifier.dispatch(tenant_id, notification);
    }
}

fn ensure_transition(alert: &Alert, requested: AlertStatus) -> Result<()> {
    if alert.status.can_transition_to(requested) {
        Ok(())
    } else {
        Err(Error::transition(alert.status, requested))
    }
}

fn append_note(existing: Option<String>, note: &str) -> String {
    format!("{}\n{note}", existing.unwrap_or_default())
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_note() {
        assert_eq!(append_note(None, "Closed: done"), "Closed: done");
        assert_eq!(
            append_note(Some("Replaced filter".to_string()), "Closed: verified"),
            "Replaced filter\nClosed: verified"
        );
    }

    #[test]
    fn test_ensure_transition_names_both_states() {
        let alert = Alert::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            crate::models::Severity::Low,
            "x",
            Utc::now(),
        );
        let err = ensure_transition(&alert, AlertStatus::Closed).unwrap_err();
        assert_eq!(err.to_string(), "Cannot move alert from open to closed");
    }
}
