//! PostgreSQL connection, sensor directory and reading queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::alerting::{ReadingStore, SensorDirectory};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{Asset, Sensor, SensorReading};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Reading queries over the `sensor_readings` table
#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    /// Create a new reading store
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn get_readings(
        &self,
        sensor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        let rows: Vec<(f64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT value, timestamp
            FROM sensor_readings
            WHERE sensor_id = $1 AND timestamp >= $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(value, timestamp)| SensorReading::new(sensor_id, value, timestamp))
            .collect())
    }

    async fn get_reading_at_or_before(
        &self,
        sensor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SensorReading>> {
        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT value, timestamp
            FROM sensor_readings
            WHERE sensor_id = $1 AND timestamp <= $2
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value, timestamp)| SensorReading::new(sensor_id, value, timestamp)))
    }
}

/// Sensor and asset lookups
#[derive(Clone)]
pub struct PgSensorDirectory {
    pool: PgPool,
}

impl PgSensorDirectory {
    /// Create a new sensor directory
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: Uuid,
    tenant_id: Uuid,
    asset_id: Uuid,
    asset_type_id: Uuid,
    asset_name: String,
    name: String,
    sensor_type: String,
    unit: String,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        Sensor {
            id: row.id,
            tenant_id: row.tenant_id,
            asset_id: row.asset_id,
            asset_type_id: row.asset_type_id,
            asset_name: row.asset_name,
            name: row.name,
            sensor_type: row.sensor_type,
            unit: row.unit,
        }
    }
}

#[async_trait]
impl SensorDirectory for PgSensorDirectory {
    async fn list_sensors(&self, tenant_id: Uuid) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            r#"
            SELECT s.id, a.tenant_id, s.asset_id, a.asset_type_id, a.name AS asset_name,
                   s.name, s.sensor_type, s.unit
            FROM sensors s
            JOIN assets a ON a.id = s.asset_id
            WHERE a.tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    async fn get_asset(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Asset>> {
        let row: Option<(Uuid, Uuid, Uuid, String)> = sqlx::query_as(
            "SELECT id, tenant_id, asset_type_id, name FROM assets WHERE id = $1 AND tenant_id = $2",
        )
        .bind(asset_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, tenant_id, asset_type_id, name)| Asset {
            id,
            tenant_id,
            asset_type_id,
            name,
        }))
    }
}
