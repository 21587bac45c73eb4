//! Alert data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Alert severity level, ordered from most to least urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs immediate attention
    Critical,
    /// Urgent
    High,
    /// Default level
    #[default]
    Medium,
    /// Informational
    Low,
}

impl Severity {
    /// Wire and storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(Error::validation(format!(
                "invalid severity '{other}', must be one of: critical, high, medium, low"
            ))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Newly triggered
    #[default]
    Open,
    /// Seen by an operator
    Acknowledged,
    /// Being worked on, usually through a work order
    InProgress,
    /// Condition handled
    Resolved,
    /// Terminal
    Closed,
}

impl AlertStatus {
    /// Statuses that block a duplicate alert for the same asset and rule
    pub const LIVE: [AlertStatus; 3] = [Self::Open, Self::Acknowledged, Self::InProgress];

    /// Wire and storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    /// Whether the alert still counts toward the dedup window
    pub fn is_live(self) -> bool {
        Self::LIVE.contains(&self)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Closing requires at least one intermediate state, and nothing leaves
    /// `resolved` except `closed`.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Open, Acknowledged)
                | (Open, InProgress)
                | (Open, Resolved)
                | (Acknowledged, InProgress)
                | (Acknowledged, Resolved)
                | (Acknowledged, Closed)
                | (InProgress, Resolved)
                | (InProgress, Closed)
                | (Resolved, Closed)
        )
    }
}

impl FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(Error::validation(format!("invalid alert status '{other}'"))),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A triggered alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Asset the alert is about
    pub asset_id: Uuid,

    /// Rule that triggered the alert (None for manual alerts)
    pub alert_rule_id: Option<Uuid>,

    /// Sensor whose readings satisfied the rule
    pub sensor_id: Option<Uuid>,

    /// Severity level
    pub severity: Severity,

    /// Current status
    pub status: AlertStatus,

    /// Short summary
    pub title: String,

    /// Longer description
    pub description: Option<String>,

    /// The sample that satisfied the rule
    pub triggered_value: Option<f64>,

    /// When the alert was triggered
    pub triggered_at: DateTime<Utc>,

    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub resolution_notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Build a fresh open alert
    pub fn open(
        tenant_id: Uuid,
        asset_id: Uuid,
        severity: Severity,
        title: impl Into<String>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            asset_id,
            alert_rule_id: None,
            sensor_id: None,
            severity,
            status: AlertStatus::Open,
            title: title.into(),
            description: None,
            triggered_value: None,
            triggered_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            created_at: triggered_at,
            updated_at: triggered_at,
        }
    }
}

/// Audit entry for one acknowledge action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertAcknowledgment {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub user_id: Uuid,
    pub acknowledged_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Input for the administrative create action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInput {
    pub asset_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

/// Filter for listing alerts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub asset_id: Option<Uuid>,
    /// Case-insensitive substring of the title
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AlertFilter {
    /// Whether an alert passes the status/severity/asset/title filters
    pub fn matches(&self, alert: &Alert) -> bool {
        self.status.map_or(true, |s| alert.status == s)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.asset_id.map_or(true, |a| alert.asset_id == a)
            && self.search().map_or(true, |needle| {
                alert.title.to_lowercase().contains(&needle.to_lowercase())
            })
    }

    /// Title search term, if any non-blank one was given
    pub fn search(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Effective page size
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }

    /// Effective page offset
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// One page of an alert listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPage {
    pub items: Vec<Alert>,
    /// Alerts matching the filter across all pages
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// Alert fields carried by notification events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub alert_rule_id: Option<Uuid>,
    pub sensor_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub triggered_value: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Alert> for AlertPayload {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id,
            asset_id: alert.asset_id,
            alert_rule_id: alert.alert_rule_id,
            sensor_id: alert.sensor_id,
            title: alert.title.clone(),
            description: alert.description.clone(),
            severity: alert.severity,
            status: alert.status,
            triggered_value: alert.triggered_value,
            triggered_at: alert.triggered_at,
            acknowledged_at: alert.acknowledged_at,
            resolved_at: alert.resolved_at,
            updated_at: alert.updated_at,
        }
    }
}

/// Event pushed to notification sinks.
///
/// Serializes as `{"type": "new_alert" | "alert_update", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AlertNotification {
    /// An alert was created
    NewAlert(AlertPayload),
    /// An existing alert changed
    AlertUpdate(AlertPayload),
}

impl AlertNotification {
    /// Event for a newly created alert
    pub fn created(alert: &Alert) -> Self {
        Self::NewAlert(alert.into())
    }

    /// Event for a changed alert
    pub fn updated(alert: &Alert) -> Self {
        Self::AlertUpdate(alert.into())
    }

    /// Event type tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewAlert(_) => "new_alert",
            Self::AlertUpdate(_) => "alert_update",
        }
    }

    /// The alert carried by the event
    pub fn alert(&self) -> &AlertPayload {
        match self {
            Self::NewAlert(p) | Self::AlertUpdate(p) => p,
        }
    }
}
