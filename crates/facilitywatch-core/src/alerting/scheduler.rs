//! Periodic evaluation driver

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::lifecycle::{AlertLifecycleManager, CycleReport};

/// Runs an evaluation cycle for every active tenant on a fixed interval
pub struct EvaluationScheduler {
    manager: Arc<AlertLifecycleManager>,
    interval: Duration,
    /// Fixed tenant list; when empty, tenants with enabled rules are used
    tenants: Vec<Uuid>,
}

impl EvaluationScheduler {
    /// Create a scheduler using the manager's configured interval
    pub fn new(manager: Arc<AlertLifecycleManager>) -> Self {
        let interval = manager.settings().check_interval;
        Self {
            manager,
            interval,
            tenants: Vec::new(),
        }
    }

    /// Restrict evaluation to the given tenants
    #[must_use]
    pub fn with_tenants(mut self, tenants: Vec<Uuid>) -> Self {
        self.tenants = tenants;
        self
    }

    /// Override the interval between ticks
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one cycle per tenant concurrently. Failed tenants are logged and
    /// left out of the result.
    pub async fn run_once(&self) -> Vec<(Uuid, CycleReport)> {
        let tenants = if self.tenants.is_empty() {
            match self.manager.active_tenants().await {
                Ok(tenants) => tenants,
                Err(e) => {
                    error!(error = %e, "Failed to list tenants for evaluation");
                    return Vec::new();
                }
            }
        } else {
            self.tenants.clone()
        };

        let cycles = tenants.into_iter().map(|tenant_id| {
            let manager = self.manager.clone();
            async move { (tenant_id, manager.run_evaluation_cycle(tenant_id).await) }
        });

        futures::future::join_all(cycles)
            .await
            .into_iter()
            .filter_map(|(tenant_id, result)| match result {
                Ok(report) => Some((tenant_id, report)),
                Err(e) => {
                    warn!(%tenant_id, error = %e, "Evaluation cycle failed");
                    None
                }
            })
            .collect()
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "Alert evaluation scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reports = self.run_once().await;
                    let created: usize = reports.iter().map(|(_, r)| r.alerts_created).sum();
                    info!(tenants = reports.len(), alerts_created = created, "Evaluation tick finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Alert evaluation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{BroadcastSink, InMemoryStore};
    use crate::config::AlertingConfig;
    use crate::models::{AlertRuleInput, Sensor};
    use chrono::Utc;

    fn manager(store: Arc<InMemoryStore>) -> Arc<AlertLifecycleManager> {
        Arc::new(AlertLifecycleManager::with_store(
            store,
            Arc::new(BroadcastSink::new(16)),
            AlertingConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_run_once_covers_active_tenants() {
        let store = Arc::new(InMemoryStore::new());
        let tenant = Uuid::new_v4();
        let asset = Uuid::new_v4();
        let sensor = Sensor {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            asset_id: asset,
            asset_type_id: Uuid::new_v4(),
            asset_name: "Boiler 2".to_string(),
            name: "Supply pressure".to_string(),
            sensor_type: "pressure".to_string(),
            unit: "psi".to_string(),
        };
        store.add_sensor(sensor.clone());
        store.add_reading(sensor.id, 140.0, Utc::now());

        let manager = manager(store.clone());
        manager
            .create_rule(
                tenant,
                AlertRuleInput {
                    name: None,
                    asset_type_id: None,
                    asset_id: Some(asset),
                    sensor_type: "pressure".to_string(),
                    condition: "gt".to_string(),
                    threshold_value: 120.0,
                    threshold_value_2: None,
                    duration_minutes: Some(0),
                    severity: Some("critical".to_string()),
                    enabled: None,
                },
            )
            .await
            .unwrap();

        let reports = EvaluationScheduler::new(manager).run_once().await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, tenant);
        assert_eq!(reports[0].1.alerts_created, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler =
            EvaluationScheduler::new(manager(store)).with_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
