//! Storage seams for the alerting engine, and the Postgres alert repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Alert, AlertAcknowledgment, AlertFilter, AlertPage, AlertRule, AlertStatus, Asset, Sensor,
    SensorReading, WorkOrder,
};

/// Append-only time-series store, written by the ingestion path
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Readings with `timestamp >= since`, ascending by timestamp
    async fn get_readings(&self, sensor_id: Uuid, since: DateTime<Utc>)
        -> Result<Vec<SensorReading>>;

    /// Latest reading with `timestamp <= at`
    async fn get_reading_at_or_before(
        &self,
        sensor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SensorReading>>;
}

/// Tenant-scoped alert rule definitions
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Persist an already validated rule
    async fn insert_rule(&self, rule: &AlertRule) -> Result<()>;

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<AlertRule>>;

    /// All rules of a tenant, newest first
    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>>;

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>>;

    /// Overwrite a stored rule; `false` when it does not exist in the tenant
    async fn update_rule(&self, rule: &AlertRule) -> Result<bool>;

    /// Remove a rule; alerts it raised keep their history without the link
    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool>;

    /// Tenants owning at least one enabled rule
    async fn list_active_tenants(&self) -> Result<Vec<Uuid>>;
}

/// Sensors and assets of a tenant
#[async_trait]
pub trait SensorDirectory: Send + Sync {
    async fn list_sensors(&self, tenant_id: Uuid) -> Result<Vec<Sensor>>;

    async fn get_asset(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Asset>>;
}

/// Result of inserting an alert under the dedup contract
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The alert was stored
    Created,
    /// A live alert for the same asset and rule already exists
    Duplicate(Alert),
}

/// Alert persistence.
///
/// Implementations enforce that at most one live alert exists per
/// `(asset_id, alert_rule_id)` at insert time, and apply status updates only
/// when the stored status still equals the expected one.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert an alert; rule-less alerts are never duplicates
    async fn insert_alert(&self, alert: &Alert) -> Result<InsertOutcome>;

    async fn get_alert(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Option<Alert>>;

    async fn find_live_alert(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<Alert>>;

    /// One page of a tenant's alerts, newest first, with the total match count
    async fn list_alerts(&self, tenant_id: Uuid, filter: &AlertFilter) -> Result<AlertPage>;

    /// Write the mutable fields of `alert` if its stored status is `expected`
    async fn update_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool>;

    /// Apply an acknowledgment (alert must still be open) and append the audit entry
    async fn acknowledge(&self, alert: &Alert, ack: &AlertAcknowledgment) -> Result<bool>;

    /// Store a work order and the alert's new state together
    async fn spawn_work_order(
        &self,
        alert: &Alert,
        expected: AlertStatus,
        work_order: &WorkOrder,
    ) -> Result<bool>;

    async fn list_acknowledgments(&self, alert_id: Uuid) -> Result<Vec<AlertAcknowledgment>>;

    async fn list_work_orders(&self, alert_id: Uuid) -> Result<Vec<WorkOrder>>;
}

/// Repository for alert rules and alerts
#[derive(Clone)]
pub struct AlertRepository {
    pool: PgPool,
}

impl AlertRepository {
    /// Create a new alert repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const LIVE_STATUSES: [&str; 3] = ["open", "acknowledged", "in_progress"];

#[async_trait]
impl RuleRepository for AlertRepository {
    async fn insert_rule(&self, rule: &AlertRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_rules (
                id, tenant_id, name, asset_type_id, asset_id, sensor_type,
                condition, threshold_value, threshold_value_2, duration_minutes,
                severity, enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(rule.id)
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(rule.asset_type_id)
        .bind(rule.asset_id)
        .bind(&rule.sensor_type)
        .bind(rule.condition.as_str())
        .bind(rule.threshold_value)
        .bind(rule.threshold_value_2)
        .bind(rule.duration_minutes)
        .bind(rule.severity.as_str())
        .bind(rule.enabled)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<Option<AlertRule>> {
        let row = sqlx::query_as::<_, AlertRuleRow>(
            "SELECT * FROM alert_rules WHERE id = $1 AND tenant_id = $2",
        )
        .bind(rule_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AlertRule::try_from).transpose()
    }

    async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(
            "SELECT * FROM alert_rules WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRule::try_from).collect()
    }

    async fn list_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(
            r#"
            SELECT * FROM alert_rules
            WHERE tenant_id = $1 AND enabled = true
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        // A row that no longer parses is skipped rather than failing the cycle
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                AlertRule::try_from(row)
                    .map_err(|e| tracing::warn!(rule_id = %id, error = %e, "Skipping invalid stored rule"))
                    .ok()
            })
            .collect())
    }

    async fn update_rule(&self, rule: &AlertRule) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alert_rules SET
                name = $3, asset_type_id = $4, asset_id = $5, sensor_type = $6,
                condition = $7, threshold_value = $8, threshold_value_2 = $9,
                duration_minutes = $10, severity = $11, enabled = $12, updated_at = $13
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(rule.id)
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(rule.asset_type_id)
        .bind(rule.asset_id)
        .bind(&rule.sensor_type)
        .bind(rule.condition.as_str())
        .bind(rule.threshold_value)
        .bind(rule.threshold_value_2)
        .bind(rule.duration_minutes)
        .bind(rule.severity.as_str())
        .bind(rule.enabled)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_rule(&self, tenant_id: Uuid, rule_id: Uuid) -> Result<bool> {
        // alerts.alert_rule_id is ON DELETE SET NULL
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1 AND tenant_id = $2")
            .bind(rule_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_active_tenants(&self) -> Result<Vec<Uuid>> {
        let tenants: Vec<(Uuid,)> =
            sqlx::query_as("SELECT DISTINCT tenant_id FROM alert_rules WHERE enabled = true")
                .fetch_all(&self.pool)
                .await?;

        Ok(tenants.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl AlertStore for AlertRepository {
    async fn insert_alert(&self, alert: &Alert) -> Result<InsertOutcome> {
        // The partial unique index on live (asset_id, alert_rule_id) makes
        // the insert itself the dedup check.
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (
                id, tenant_id, asset_id, alert_rule_id, sensor_id, severity, status,
                title, description, triggered_value, triggered_at,
                acknowledged_at, acknowledged_by, resolved_at, resolved_by,
                resolution_notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(alert.id)
        .bind(alert.tenant_id)
        .bind(alert.asset_id)
        .bind(alert.alert_rule_id)
        .bind(alert.sensor_id)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(alert.triggered_value)
        .bind(alert.triggered_at)
        .bind(alert.acknowledged_at)
        .bind(alert.acknowledged_by)
        .bind(alert.resolved_at)
        .bind(alert.resolved_by)
        .bind(&alert.resolution_notes)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Created);
        }

        let Some(rule_id) = alert.alert_rule_id else {
            return Err(Error::conflict(format!("alert {} already exists", alert.id)));
        };

        match self
            .find_live_alert(alert.tenant_id, alert.asset_id, rule_id)
            .await?
        {
            Some(existing) => Ok(InsertOutcome::Duplicate(existing)),
            None => Err(Error::conflict(format!(
                "live alert for asset {} and rule {rule_id} changed concurrently",
                alert.asset_id
            ))),
        }
    }

    async fn get_alert(&self, tenant_id: Uuid, alert_id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM alerts WHERE id = $1 AND tenant_id = $2",
        )
        .bind(alert_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Alert::try_from).transpose()
    }

    async fn find_live_alert(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT * FROM alerts
            WHERE tenant_id = $1 AND asset_id = $2 AND alert_rule_id = $3
              AND status = ANY($4)
            "#,
        )
        .bind(tenant_id)
        .bind(asset_id)
        .bind(rule_id)
        .bind(&LIVE_STATUSES[..])
        .fetch_optional(&self.pool)
        .await?;

        row.map(Alert::try_from).transpose()
    }

    async fn list_alerts(&self, tenant_id: Uuid, filter: &AlertFilter) -> Result<AlertPage> {
        const MATCHING: &str = r#"
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR severity = $3)
              AND ($4::uuid IS NULL OR asset_id = $4)
              AND ($5::text IS NULL OR title ILIKE $5)
        "#;

        let status = filter.status.map(AlertStatus::as_str);
        let severity = filter.severity.map(|s| s.as_str());
        let search = filter.search().map(like_pattern);

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM alerts {MATCHING}"))
            .bind(tenant_id)
            .bind(status)
            .bind(severity)
            .bind(filter.asset_id)
            .bind(search.as_deref())
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, AlertRow>(&format!(
            "SELECT * FROM alerts {MATCHING} ORDER BY triggered_at DESC LIMIT $6 OFFSET $7"
        ))
        .bind(tenant_id)
        .bind(status)
        .bind(severity)
        .bind(filter.asset_id)
        .bind(search.as_deref())
        .bind(filter.limit())
        .bind(filter.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(AlertPage {
            items: rows.into_iter().map(Alert::try_from).collect::<Result<_>>()?,
            total,
            offset: filter.offset(),
            limit: filter.limit(),
        })
    }

    async fn update_alert(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        let result = update_alert_query(alert, expected)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn acknowledge(&self, alert: &Alert, ack: &AlertAcknowledgment) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = update_alert_query(alert, AlertStatus::Open)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO alert_acknowledgments (id, alert_id, user_id, acknowledged_at, note)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(ack.id)
        .bind(ack.alert_id)
        .bind(ack.user_id)
        .bind(ack.acknowledged_at)
        .bind(&ack.note)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn spawn_work_order(
        &self,
        alert: &Alert,
        expected: AlertStatus,
        work_order: &WorkOrder,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = update_alert_query(alert, expected).execute(&mut *tx).await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO work_orders (
                id, tenant_id, asset_id, alert_id, title, description,
                type, priority, status, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            "#,
        )
        .bind(work_order.id)
        .bind(work_order.tenant_id)
        .bind(work_order.asset_id)
        .bind(work_order.alert_id)
        .bind(&work_order.title)
        .bind(&work_order.description)
        .bind(work_order.work_order_type.as_str())
        .bind(work_order.priority.as_str())
        .bind(&work_order.status)
        .bind(work_order.created_by)
        .bind(work_order.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_acknowledgments(&self, alert_id: Uuid) -> Result<Vec<AlertAcknowledgment>> {
        let rows: Vec<(Uuid, Uuid, Uuid, DateTime<Utc>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, alert_id, user_id, acknowledged_at, note
            FROM alert_acknowledgments
            WHERE alert_id = $1
            ORDER BY acknowledged_at ASC
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, alert_id, user_id, acknowledged_at, note)| AlertAcknowledgment {
                id,
                alert_id,
                user_id,
                acknowledged_at,
                note,
            })
            .collect())
    }

    async fn list_work_orders(&self, alert_id: Uuid) -> Result<Vec<WorkOrder>> {
        let rows = sqlx::query_as::<_, WorkOrderRow>(
            r#"
            SELECT id, tenant_id, asset_id, alert_id, title, description,
                   type, priority, status, created_by, created_at
            FROM work_orders
            WHERE alert_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkOrder::try_from).collect()
    }
}

/// `%term%` with LIKE metacharacters in `term` escaped
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn update_alert_query(
    alert: &Alert,
    expected: AlertStatus,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        UPDATE alerts SET
            status = $4,
            triggered_value = $5,
            acknowledged_at = $6,
            acknowledged_by = $7,
            resolved_at = $8,
            resolved_by = $9,
            resolution_notes = $10,
            updated_at = $11
        WHERE id = $1 AND tenant_id = $2 AND status = $3
        "#,
    )
    .bind(alert.id)
    .bind(alert.tenant_id)
    .bind(expected.as_str())
    .bind(alert.status.as_str())
    .bind(alert.triggered_value)
    .bind(alert.acknowledged_at)
    .bind(alert.acknowledged_by)
    .bind(alert.resolved_at)
    .bind(alert.resolved_by)
    .bind(&alert.resolution_notes)
    .bind(alert.updated_at)
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct AlertRuleRow {
    id: Uuid,
    tenant_id: Uuid,
    name: Option<String>,
    asset_type_id: Option<Uuid>,
    asset_id: Option<Uuid>,
    sensor_type: String,
    condition: String,
    threshold_value: f64,
    threshold_value_2: Option<f64>,
    duration_minutes: i32,
    severity: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = Error;

    fn try_from(row: AlertRuleRow) -> Result<Self> {
        Ok(AlertRule {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            asset_type_id: row.asset_type_id,
            asset_id: row.asset_id,
            sensor_type: row.sensor_type,
            condition: row.condition.parse()?,
            threshold_value: row.threshold_value,
            threshold_value_2: row.threshold_value_2,
            duration_minutes: row.duration_minutes,
            severity: row.severity.parse()?,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    tenant_id: Uuid,
    asset_id: Uuid,
    alert_rule_id: Option<Uuid>,
    sensor_id: Option<Uuid>,
    severity: String,
    status: String,
    title: String,
    description: Option<String>,
    triggered_value: Option<f64>,
    triggered_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_by: Option<Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Uuid>,
    resolution_notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.id,
            tenant_id: row.tenant_id,
            asset_id: row.asset_id,
            alert_rule_id: row.alert_rule_id,
            sensor_id: row.sensor_id,
            severity: row.severity.parse()?,
            status: row.status.parse()?,
            title: row.title,
            description: row.description,
            triggered_value: row.triggered_value,
            triggered_at: row.triggered_at,
            acknowledged_at: row.acknowledged_at,
            acknowledged_by: row.acknowledged_by,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            resolution_notes: row.resolution_notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkOrderRow {
    id: Uuid,
    tenant_id: Uuid,
    asset_id: Uuid,
    alert_id: Option<Uuid>,
    title: String,
    description: Option<String>,
    #[sqlx(rename = "type")]
    work_order_type: String,
    priority: String,
    status: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<WorkOrderRow> for WorkOrder {
    type Error = Error;

    fn try_from(row: WorkOrderRow) -> Result<Self> {
        let work_order_type = serde_json::from_value(serde_json::Value::String(row.work_order_type))?;
        let priority = serde_json::from_value(serde_json::Value::String(row.priority))?;

        Ok(WorkOrder {
            id: row.id,
            tenant_id: row.tenant_id,
            asset_id: row.asset_id,
            alert_id: row.alert_id,
            title: row.title,
            description: row.description,
            work_order_type,
            priority,
            status: row.status,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("chiller"), "%chiller%");
        assert_eq!(like_pattern("100%_load"), "%100\\%\\_load%");
    }
}
