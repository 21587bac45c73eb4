//! Redis connection and pub/sub streaming

use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::RedisConfig as AppRedisConfig;
use crate::error::{Error, Result};
use crate::models::AlertNotification;

/// Channel carrying a tenant's alert events
pub fn alert_channel(tenant_id: Uuid) -> String {
    format!("facilitywatch:alerts:{tenant_id}")
}

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Create a new Redis connection pool
    pub fn new(config: &AppRedisConfig) -> Result<Self> {
        let mut cfg = RedisConfig::from_url(&config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.max_connections as usize));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Redis(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Publishes alert events on per-tenant channels
#[derive(Clone)]
pub struct RedisStreamer {
    pool: Pool,
}

impl RedisStreamer {
    /// Create a new Redis streamer
    pub fn new(pool: &RedisPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }

    /// Publish an event; returns the number of subscribers that received it
    pub async fn publish_alert(
        &self,
        tenant_id: Uuid,
        notification: &AlertNotification,
    ) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let payload = serde_json::to_string(notification)?;

        let receivers: u64 = conn.publish(alert_channel(tenant_id), payload).await?;
        Ok(receivers)
    }
}
