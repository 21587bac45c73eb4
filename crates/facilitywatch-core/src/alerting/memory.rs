//! In-process implementation of every storage seam
//!
//! Backs the engine and API tests without a database. Writes follow the
//! same contracts as the Postgres repository: dedup at insert time and
//! compare-and-set status updates, each under a single write lock.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::repository::{AlertStore, InsertOutcome, ReadingStore, RuleRepository, SensorDirectory};
use crate::error::{Error, Result};
use crate::models::{
    Alert, AlertAcknowledgment, AlertFilter, AlertPage, AlertRule, AlertStatus, Asset, Sensor,
    SensorReading, WorkOrder,
};

/// Injected misbehaviour for a sensor's reading queries
#[derive(Debug, Clone, Copy)]
enum SensorFault {
    Fail,
    Stall(Duration),
}

#[derive(Default)]
struct State {
    assets: HashMap<Uuid, Asset>,
    sensors: HashMap<Uuid, Sensor>,
    /// Kept ascending by timestamp
    readings: HashMap<Uuid, Vec<SensorReading>>,
    rules: HashMap<Uuid, AlertRule>,
    alerts: HashMap<Uuid, Alert>,
    acknowledgments: Vec<AlertAcknowledgment>,
    work_orders: Vec<WorkOrder>,
}

/// Thread-safe in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    faults: RwLock<HashMap<Uuid, SensorFault>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset
    pub fn add_asset(&self, asset: Asset) {
        self.state.write().assets.insert(asset.id, asset);
    }

    /// Register a sensor, creating its asset record if unknown
    pub fn add_sensor(&self, sensor: Sensor) {
        let mut state = self.state.write();
        state.assets.entry(sensor.asset_id).or_insert_with(|| Asset {
            id: sensor.asset_id,
            tenant_id: sensor.tenant_id,
            asset_type_id: sensor.asset_type_id,
            name: sensor.asset_name.clone(),
        });
        state.sensors.insert(sensor.id, sensor);
    }

    /// Append a reading, keeping the sensor's series ordered
    pub fn add_reading(&self, sensor_id: Uuid, value: f64, timestamp: DateTime<Utc>) {
        let mut state = self.state.write();
        let series = state.readings.entry(sensor_id).or_default();
        let at = series.partition_point(|r| r.timestamp <= timestamp);
        series.insert(at, SensorReading::new(sensor_id, value, timestamp));
    }

    /// Make every reading query for `sensor_id` fail
    pub fn fail_sensor(&self, sensor_id: Uuid) {
        self.faults.write().insert(sensor_id, SensorFault::Fail);
    }

    /// Delay every reading query for `sensor_id`
    pub fn stall_sensor(&self, sensor_id: Uuid, delay: Duration) {
        self.faults.write().insert(sensor_id, SensorFault::Stall(delay));
    }

    /// Remove injected faults for a sensor
    pub fn heal_sensor(&self, sensor_id: Uuid) {
        self.faults.write().remove(&sensor_id);
    }

    /// Every stored alert, across tenants, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.state.read().alerts.values().cloned().collect();
        alerts.sort_by_key(|a| (a.created_at, a.id));
        alerts
    }

    async fn apply_fault(&self, sensor_id: Uuid) -> Result<()> {
        // Copy out before awaiting so no guard is held across the sleep
        let fault = self.faults.read().get(&sensor_id).copied();
        match fault {
            Some(SensorFault::Fail) => Err(Error::internal(format!(
                "reading store unavailable for sensor {sensor_id}"
            ))),
            Some(SensorFault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ReadingStore for InMemoryStore {
    async fn get_readings(
        &self,
        sensor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        self.apply_fault(sensor_id).await?;

        let state = self.state.read();
        let Some(series) = state.readings.get(&sensor_id) else {
            return Ok(Vec::new());
        };
        let from = series.partition_point(|r| r.timestamp < since);
        Ok(series[from..].to_vec())
    }

    async fn get_reading_at_or_before(
        &self,
        sensor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SensorReading>> {
        self.apply_fault(sensor_id).await?;

        let state = self.state.read();
        Ok(state.readings.get(&sensor_id).and_then(|series| {
            series[..series.partition_point(|r| r.timestamp <= at)]
                .last()
                .copied()
        }))
    }
}

#[async_trait]
impl RuleRepository for InMemoryStore {
    async fn insert_rule(&self, rule: &AlertRule) -> Result<()> {
        let mut state = self.state.write();
        if state.rules.contains_key(&rule.id) {
            return Err(Error::conflict(format!("alert rule {} already exists", rule.id)));
        }
        state.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<AlertRule>> {
        Ok(self
            .state
            .read()
            .rules
            .get(&rule_id)
            .filter(|rule| rule.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>> {
        let mut rules: Vec<AlertRule> = self
            .state
            .read()
            .rules
            .values()
            .filter(|rule| rule.tenant_id == tenant_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>> {
        let mut rules = self.list_rules(tenant_id).await?;
        rules.retain(|rule| rule.enabled);
        Ok(rules)
    }

    async fn update_rule(&self, rule: &AlertRule) -> Result<bool> {
        let mut state = self.state.write();
        match state.rules.get_mut(&rule.id) {
            Some(stored) if stored.tenant_id == rule.tenant_id => {
                *stored = rule.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool> {
        let mut state = self.state.write();
        if !state
            .rules
            .get(&rule_id)
            .is_some_and(|rule| rule.tenant_id == tenant_id)
        {
            return Ok(false);
        }

        state.rules.remove(&rule_id);
        // Mirrors ON DELETE SET NULL
        for alert in state.alerts.values_mut() {
            if alert.alert_rule_id == Some(rule_id) {
                alert.alert_rule_id = None;
            }
        }
        Ok(true)
    }

    async fn list_active_tenants(&self) -> Result<Vec<Uuid>> {
        let tenants: BTreeSet<Uuid> = self
            .state
            .read()
            .rules
            .values()
            .filter(|rule| rule.enabled)
            .map(|rule| rule.tenant_id)
            .collect();
        Ok(tenants.into_iter().collect())
    }
}

#[async_trait]
impl SensorDirectory for InMemoryStore {
    async fn list_sensors(&self, tenant_id: Uuid) -> Result<Vec<Sensor>> {
        Ok(self
            .state
            .read()
            .sensors
            .values()
            .filter(|sensor| sensor.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn get_asset(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Asset>> {
        Ok(self
            .state
            .read()
            .assets
            .get(&asset_id)
            .filter(|asset| asset.tenant_id == tenant_id)
            .cloned())
    }
}

fn find_live(state: &State, tenant_id: Uuid, asset_id: Uuid, rule_id: Uuid) -> Option<&Alert> {
    state.alerts.values().find(|alert| {
        alert.tenant_id == tenant_id
            && alert.asset_id == asset_id
            && alert.alert_rule_id == Some(rule_id)
            && alert.status.is_live()
    })
}

/// Replace the stored alert if it still has the expected status
fn compare_and_set(state: &mut State, alert: &Alert, expected: AlertStatus) -> bool {
    match state.alerts.get_mut(&alert.id) {
        Some(stored) if stored.tenant_id == alert.tenant_id && stored.status == expected => {
            *stored = alert.clone();
            true
        }
        _ => false,
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<InsertOutcome> {
        let mut state = self.state.write();

        if let Some(rule_id) = alert.alert_rule_id {
            if let Some(existing) = find_live(&state, alert.tenant_id, alert.asset_id, rule_id) {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
        }
        if state.alerts.contains_key(&alert.id) {
            return Err(Error::conflict(format!("alert {} already exists", alert.id)));
        }

        state.alerts.insert(alert.id, alert.clone());
        Ok(InsertOutcome::Created)
    }

    async fn get_alert(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Option<Alert>> {
        Ok(self
            .state
            .read()
            .alerts
            .get(&alert_id)
            .filter(|alert| alert.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_live_alert(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<Alert>> {
        Ok(find_live(&self.state.read(), tenant_id, asset_id, rule_id).cloned())
    }

    async fn list_alerts(&self, tenant_id: Uuid, filter: &AlertFilter) -> Result<AlertPage> {
        let state = self.state.read();
        let mut alerts: Vec<&Alert> = state
            .alerts
            .values()
            .filter(|alert| alert.tenant_id == tenant_id && filter.matches(alert))
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(a.id.cmp(&b.id)));

        let offset = usize::try_from(filter.offset()).unwrap_or(0);
        let limit = usize::try_from(filter.limit()).unwrap_or(usize::MAX);
        Ok(AlertPage {
            total: i64::try_from(alerts.len()).unwrap_or(i64::MAX),
            items: alerts.into_iter().skip(offset).take(limit).cloned().collect(),
            offset: filter.offset(),
            limit: filter.limit(),
        })
    }

    async fn update_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        Ok(compare_and_set(&mut self.state.write(), alert, expected))
    }

    async fn acknowledge(&self, alert: &Alert, ack: &AlertAcknowledgment) -> Result<bool> {
        let mut state = self.state.write();
        if !compare_and_set(&mut state, alert, AlertStatus::Open) {
            return Ok(false);
        }
        state.acknowledgments.push(ack.clone());
        Ok(true)
    }

    async fn spawn_work_order(
        &self,
        alert: &Alert,
        expected: AlertStatus,
        work_order: &WorkOrder,
    ) -> Result<bool> {
        let mut state = self.state.write();
        if !compare_and_set(&mut state, alert, expected) {
            return Ok(false);
        }
        state.work_orders.push(work_order.clone());
        Ok(true)
    }

    async fn list_acknowledgments(&self, alert_id: Uuid) -> Result<Vec<AlertAcknowledgment>> {
        Ok(self
            .state
            .read()
            .acknowledgments
            .iter()
            .filter(|ack| ack.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn list_work_orders(&self, alert_id: Uuid) -> Result<Vec<WorkOrder>> {
        Ok(self
            .state
            .read()
            .work_orders
            .iter()
            .filter(|wo| wo.alert_id == Some(alert_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Duration as ChronoDuration;

    fn rule_alert(tenant: Uuid, asset: Uuid, rule: Uuid) -> Alert {
        let mut alert = Alert::open(tenant, asset, Severity::High, "temperature above 80", Utc::now());
        alert.alert_rule_id = Some(rule);
        alert
    }

    #[tokio::test]
    async fn test_insert_dedups_live_alerts() {
        let store = InMemoryStore::new();
        let (tenant, asset, rule) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = rule_alert(tenant, asset, rule);
        assert_eq!(store.insert_alert(&first).await.unwrap(), InsertOutcome::Created);

        let second = rule_alert(tenant, asset, rule);
        match store.insert_alert(&second).await.unwrap() {
            InsertOutcome::Duplicate(existing) => assert_eq!(existing.id, first.id),
            InsertOutcome::Created => panic!("duplicate live alert was stored"),
        }
        assert_eq!(store.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_resolved_alert_does_not_block_new_one() {
        let store = InMemoryStore::new();
        let (tenant, asset, rule) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let mut first = rule_alert(tenant, asset, rule);
        store.insert_alert(&first).await.unwrap();
        first.status = AlertStatus::Resolved;
        assert!(store.update_alert(&first, AlertStatus::Open).await.unwrap());

        let second = rule_alert(tenant, asset, rule);
        assert_eq!(store.insert_alert(&second).await.unwrap(), InsertOutcome::Created);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = InMemoryStore::new();
        let mut alert = rule_alert(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.insert_alert(&alert).await.unwrap();

        alert.status = AlertStatus::Resolved;
        assert!(!store.update_alert(&alert, AlertStatus::Acknowledged).await.unwrap());
        assert!(store.update_alert(&alert, AlertStatus::Open).await.unwrap());
    }

    #[tokio::test]
    async fn test_alerts_are_tenant_scoped() {
        let store = InMemoryStore::new();
        let alert = rule_alert(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.insert_alert(&alert).await.unwrap();

        assert!(store.get_alert(Uuid::new_v4(), alert.id).await.unwrap().is_none());
        assert!(store.get_alert(alert.tenant_id, alert.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reading_queries() {
        let store = InMemoryStore::new();
        let sensor = Uuid::new_v4();
        let t0 = Utc::now();
        // Inserted out of order on purpose
        store.add_reading(sensor, 2.0, t0 + ChronoDuration::minutes(10));
        store.add_reading(sensor, 1.0, t0);
        store.add_reading(sensor, 3.0, t0 + ChronoDuration::minutes(20));

        let since = store
            .get_readings(sensor, t0 + ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert_eq!(since.iter().map(|r| r.value).collect::<Vec<_>>(), vec![2.0, 3.0]);

        let anchor = store
            .get_reading_at_or_before(sensor, t0 + ChronoDuration::minutes(15))
            .await
            .unwrap();
        assert_eq!(anchor.map(|r| r.value), Some(2.0));
        assert!(store
            .get_reading_at_or_before(sensor, t0 - ChronoDuration::minutes(1))
            .await
            .unwrap()
            .is_none());
    }

    fn power_rule(tenant: Uuid, enabled: bool) -> AlertRule {
        crate::models::AlertRuleInput {
            name: None,
            asset_type_id: None,
            asset_id: None,
            sensor_type: "power".to_string(),
            condition: "gt".to_string(),
            threshold_value: 450.0,
            threshold_value_2: None,
            duration_minutes: None,
            severity: None,
            enabled: Some(enabled),
        }
        .into_rule(tenant)
        .unwrap()
    }

    #[test]
    fn test_active_tenants_ignore_disabled_rules() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();

        tokio_test::block_on(async {
            store.insert_rule(&power_rule(tenant, true)).await.unwrap();
            store.insert_rule(&power_rule(Uuid::new_v4(), false)).await.unwrap();

            assert_eq!(store.list_active_tenants().await.unwrap(), vec![tenant]);
        });
    }

    #[tokio::test]
    async fn test_delete_rule_unlinks_its_alerts() {
        let store = InMemoryStore::new();
        let rule = power_rule(Uuid::new_v4(), true);
        store.insert_rule(&rule).await.unwrap();
        let alert = rule_alert(rule.tenant_id, Uuid::new_v4(), rule.id);
        store.insert_alert(&alert).await.unwrap();

        assert!(!store.delete_rule(Uuid::new_v4(), rule.id).await.unwrap());
        assert!(store.delete_rule(rule.tenant_id, rule.id).await.unwrap());

        assert!(store.get_rule(rule.tenant_id, rule.id).await.unwrap().is_none());
        let stored = store.get_alert(alert.tenant_id, alert.id).await.unwrap().unwrap();
        assert_eq!(stored.alert_rule_id, None);
    }

    #[tokio::test]
    async fn test_update_rule_is_tenant_scoped() {
        let store = InMemoryStore::new();
        let mut rule = power_rule(Uuid::new_v4(), true);
        store.insert_rule(&rule).await.unwrap();

        rule.threshold_value = 500.0;
        assert!(store.update_rule(&rule).await.unwrap());

        let mut foreign = rule.clone();
        foreign.tenant_id = Uuid::new_v4();
        assert!(!store.update_rule(&foreign).await.unwrap());

        let stored = store.get_rule(rule.tenant_id, rule.id).await.unwrap().unwrap();
        assert_eq!(stored.threshold_value, 500.0);
    }

    #[tokio::test]
    async fn test_list_alerts_reports_total_beyond_page() {
        let store = InMemoryStore::new();
        let tenant = Uuid::new_v4();
        for _ in 0..3 {
            store
                .insert_alert(&Alert::open(tenant, Uuid::new_v4(), Severity::Low, "Boiler pressure low", Utc::now()))
                .await
                .unwrap();
        }

        let filter = AlertFilter {
            limit: Some(2),
            offset: Some(2),
            ..AlertFilter::default()
        };
        let page = store.list_alerts(tenant, &filter).await.unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!((page.offset, page.limit), (2, 2));
    }

    #[tokio::test]
    async fn test_failing_sensor() {
        let store = InMemoryStore::new();
        let sensor = Uuid::new_v4();
        store.fail_sensor(sensor);
        assert!(store.get_readings(sensor, Utc::now()).await.is_err());

        store.heal_sensor(sensor);
        assert!(store.get_readings(sensor, Utc::now()).await.is_ok());
    }
}
