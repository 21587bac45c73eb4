#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use facilitywatch::alerting::{AlertLifecycleManager, InMemoryStore, NotificationSink};
use facilitywatch::config::AlertingConfig;
use facilitywatch::models::{AlertNotification, AlertRule, AlertRuleInput, Sensor};
use facilitywatch::{Error, Result};

/// Sink that records every event and can be told to fail or stall
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Uuid, AlertNotification)>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(Uuid, AlertNotification)> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, n)| n.kind()).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every later publish hang forever
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, tenant_id: Uuid, notification: AlertNotification) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Notification("sink offline".to_string()));
        }
        self.events.lock().push((tenant_id, notification));
        Ok(())
    }
}

/// Fixed reference instant; tests speak in minutes after it
pub fn base() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn minute(m: i64) -> DateTime<Utc> {
    base() + Duration::minutes(m)
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub manager: Arc<AlertLifecycleManager>,
    pub tenant: Uuid,
    pub user: Uuid,
    pub chiller_type: Uuid,
    pub chiller: Sensor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(AlertingConfig::default())
    }

    pub fn with_settings(settings: AlertingConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(AlertLifecycleManager::with_store(
            store.clone(),
            sink.clone(),
            settings,
        ));

        let tenant = Uuid::new_v4();
        let chiller_type = Uuid::new_v4();
        let chiller = sensor(tenant, Uuid::new_v4(), chiller_type, "Chiller 1", "temperature");
        store.add_sensor(chiller.clone());

        Self {
            store,
            sink,
            manager,
            tenant,
            user: Uuid::new_v4(),
            chiller_type,
            chiller,
        }
    }

    /// Events delivered so far, after draining the dispatch queue
    pub async fn events(&self) -> Vec<(Uuid, AlertNotification)> {
        self.manager.flush_notifications().await;
        self.sink.events()
    }

    pub async fn kinds(&self) -> Vec<&'static str> {
        self.manager.flush_notifications().await;
        self.sink.kinds()
    }

    /// Add another sensor in the harness tenant
    pub fn add_sensor(&self, asset_name: &str, sensor_type: &str) -> Sensor {
        let sensor = sensor(
            self.tenant,
            Uuid::new_v4(),
            self.chiller_type,
            asset_name,
            sensor_type,
        );
        self.store.add_sensor(sensor.clone());
        sensor
    }

    /// Readings for the chiller at (minute, value)
    pub fn readings(&self, samples: &[(i64, f64)]) {
        for &(m, value) in samples {
            self.store.add_reading(self.chiller.id, value, minute(m));
        }
    }

    /// Store a rule scoped to the chiller asset
    pub async fn rule(&self, condition: &str, threshold: f64, duration_minutes: i32) -> AlertRule {
        self.manager
            .create_rule(
                self.tenant,
                rule_input(
                    Some(self.chiller.asset_id),
                    condition,
                    threshold,
                    duration_minutes,
                ),
            )
            .await
            .unwrap()
    }
}

pub fn sensor(
    tenant: Uuid,
    asset: Uuid,
    asset_type: Uuid,
    asset_name: &str,
    sensor_type: &str,
) -> Sensor {
    Sensor {
        id: Uuid::new_v4(),
        tenant_id: tenant,
        asset_id: asset,
        asset_type_id: asset_type,
        asset_name: asset_name.to_string(),
        name: format!("{asset_name} {sensor_type}"),
        sensor_type: sensor_type.to_string(),
        unit: "F".to_string(),
    }
}

pub fn rule_input(
    asset_id: Option<Uuid>,
    condition: &str,
    threshold: f64,
    duration_minutes: i32,
) -> AlertRuleInput {
    AlertRuleInput {
        name: None,
        asset_type_id: None,
        asset_id,
        sensor_type: "temperature".to_string(),
        condition: condition.to_string(),
        threshold_value: threshold,
        threshold_value_2: None,
        duration_minutes: Some(duration_minutes),
        severity: Some("high".to_string()),
        enabled: None,
    }
}
