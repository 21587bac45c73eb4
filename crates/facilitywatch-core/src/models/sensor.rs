//! Sensor and reading models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The asset facts the engine needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub asset_type_id: Uuid,
    pub name: String,
}

/// A sensor together with the asset facts rule matching needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Unique identifier
    pub id: Uuid,

    /// Tenant owning the sensor's asset
    pub tenant_id: Uuid,

    /// Asset the sensor belongs to
    pub asset_id: Uuid,

    /// Type of the owning asset
    pub asset_type_id: Uuid,

    /// Name of the owning asset
    pub asset_name: String,

    /// Sensor display name
    pub name: String,

    /// Type tag, e.g. "temperature", "power", "flow"
    pub sensor_type: String,

    /// Measurement unit, e.g. "F", "kW", "GPM"
    pub unit: String,
}

/// An immutable timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: Uuid,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Create a reading
    pub fn new(sensor_id: Uuid, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sensor_id,
            value,
            timestamp,
        }
    }
}
