//! Work order models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work order priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Kind of maintenance work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkOrderType {
    /// Raised in response to an alert or failure
    #[default]
    Reactive,
    Preventive,
    Inspection,
    Corrective,
}

impl WorkOrderType {
    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reactive => "reactive",
            Self::Preventive => "preventive",
            Self::Inspection => "inspection",
            Self::Corrective => "corrective",
        }
    }
}

/// A maintenance task, optionally spawned from an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub asset_id: Uuid,
    /// Source alert; the alert does not depend on this link
    pub alert_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub work_order_type: WorkOrderType,
    pub priority: Priority,
    /// Work order workflow status; always "open" on creation
    pub status: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Input for spawning a work order from an alert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkOrderInput {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}
