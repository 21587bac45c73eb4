//! Alert rule models and validation

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alert::Severity;
use crate::error::{Error, Result};

/// Comparison applied to each reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal to
    Gte,
    /// Less than or equal to
    Lte,
    /// Equal to, within a tolerance
    Eq,
    /// Inclusive range `[threshold_value, threshold_value_2]`
    Between,
}

impl Condition {
    /// Wire and storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Eq => "eq",
            Self::Between => "between",
        }
    }

    /// Human phrase used in alert titles
    pub fn phrase(self) -> &'static str {
        match self {
            Self::Gt => "above",
            Self::Lt => "below",
            Self::Gte => "at or above",
            Self::Lte => "at or below",
            Self::Eq => "equal to",
            Self::Between => "between",
        }
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gt" => Ok(Self::Gt),
            "lt" => Ok(Self::Lt),
            "gte" => Ok(Self::Gte),
            "lte" => Ok(Self::Lte),
            "eq" => Ok(Self::Eq),
            "between" => Ok(Self::Between),
            other => Err(Error::validation(format!(
                "invalid condition '{other}', must be one of: gt, lt, gte, lte, eq, between"
            ))),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which assets a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// A single asset
    Asset(Uuid),
    /// Every asset of one asset type
    AssetType(Uuid),
    /// Every asset in the tenant
    Tenant,
}

/// An alert rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Optional human-readable name
    pub name: Option<String>,

    // Scope
    /// Type-wide scope
    pub asset_type_id: Option<Uuid>,

    /// Single-asset scope
    pub asset_id: Option<Uuid>,

    // Condition
    /// Matched against a sensor's declared type
    pub sensor_type: String,

    /// Comparison operator
    pub condition: Condition,

    /// Threshold value
    pub threshold_value: f64,

    /// Upper bound, only used by `between`
    pub threshold_value_2: Option<f64>,

    /// How long the condition must hold; 0 triggers on the latest sample
    pub duration_minutes: i32,

    /// Severity copied onto triggered alerts
    pub severity: Severity,

    /// Whether the engine evaluates the rule
    pub enabled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Resolve the rule's scope
    pub fn scope(&self) -> RuleScope {
        match (self.asset_id, self.asset_type_id) {
            (Some(asset_id), _) => RuleScope::Asset(asset_id),
            (None, Some(type_id)) => RuleScope::AssetType(type_id),
            (None, None) => RuleScope::Tenant,
        }
    }

    /// Name shown to operators
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!(
                "{} {} {}",
                self.sensor_type, self.condition, self.threshold_value
            ),
        }
    }

    /// Human description of the condition, e.g. "temperature above 80"
    pub fn describe_condition(&self) -> String {
        match (self.condition, self.threshold_value_2) {
            (Condition::Between, Some(upper)) => format!(
                "{} between {} and {}",
                self.sensor_type, self.threshold_value, upper
            ),
            (condition, _) => format!(
                "{} {} {}",
                self.sensor_type,
                condition.phrase(),
                self.threshold_value
            ),
        }
    }

    /// Check whether a single value satisfies the condition
    pub fn check(&self, value: f64, eq_tolerance: f64) -> bool {
        let threshold = self.threshold_value;

        match self.condition {
            Condition::Gt => value > threshold,
            Condition::Lt => value < threshold,
            Condition::Gte => value >= threshold,
            Condition::Lte => value <= threshold,
            Condition::Eq => (value - threshold).abs() <= eq_tolerance,
            Condition::Between => match self.threshold_value_2 {
                Some(upper) => threshold <= value && value <= upper,
                None => false,
            },
        }
    }
}

/// Input for creating a new alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleInput {
    pub name: Option<String>,
    pub asset_type_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub sensor_type: String,
    pub condition: String,
    pub threshold_value: f64,
    pub threshold_value_2: Option<f64>,
    pub duration_minutes: Option<i32>,
    pub severity: Option<String>,
    pub enabled: Option<bool>,
}

impl AlertRuleInput {
    /// Validate the input and build a rule for `tenant_id`
    pub fn into_rule(self, tenant_id: Uuid) -> Result<AlertRule> {
        let condition: Condition = self.condition.parse()?;
        let severity: Severity = match self.severity.as_deref() {
            Some(s) => s.parse()?,
            None => Severity::default(),
        };

        if self.sensor_type.trim().is_empty() {
            return Err(Error::validation("sensor_type must not be empty"));
        }

        if self.asset_id.is_some() && self.asset_type_id.is_some() {
            return Err(Error::validation(
                "a rule is scoped to either an asset or an asset type, not both",
            ));
        }

        if !self.threshold_value.is_finite() {
            return Err(Error::validation("threshold_value must be a finite number"));
        }

        let duration_minutes = self.duration_minutes.unwrap_or(15);
        if duration_minutes < 0 {
            return Err(Error::validation("duration_minutes must not be negative"));
        }

        let threshold_value_2 = if condition == Condition::Between {
            let upper = self.threshold_value_2.ok_or_else(|| {
                Error::validation("between condition requires threshold_value_2")
            })?;
            if !upper.is_finite() || self.threshold_value >= upper {
                return Err(Error::validation(
                    "between condition requires threshold_value < threshold_value_2",
                ));
            }
            Some(upper)
        } else {
            // Ignored by every other condition
            None
        };

        let now = Utc::now();
        Ok(AlertRule {
            id: Uuid::new_v4(),
            tenant_id,
            name: self.name.filter(|n| !n.trim().is_empty()),
            asset_type_id: self.asset_type_id,
            asset_id: self.asset_id,
            sensor_type: self.sensor_type,
            condition,
            threshold_value: self.threshold_value,
            threshold_value_2,
            duration_minutes,
            severity,
            enabled: self.enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of an alert rule; absent fields keep their current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertRuleUpdate {
    pub name: Option<String>,
    pub asset_type_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub sensor_type: Option<String>,
    pub condition: Option<String>,
    pub threshold_value: Option<f64>,
    pub threshold_value_2: Option<f64>,
    pub duration_minutes: Option<i32>,
    pub severity: Option<String>,
    pub enabled: Option<bool>,
}

impl AlertRuleUpdate {
    /// Merge the update into `rule` and validate the result as a new rule
    /// would be. Identity and creation time are preserved.
    pub fn apply(self, rule: &AlertRule) -> Result<AlertRule> {
        // Giving either scope replaces the stored one
        let (asset_id, asset_type_id) = match (self.asset_id, self.asset_type_id) {
            (None, None) => (rule.asset_id, rule.asset_type_id),
            scope => scope,
        };

        let input = AlertRuleInput {
            name: self.name.or_else(|| rule.name.clone()),
            asset_type_id,
            asset_id,
            sensor_type: self.sensor_type.unwrap_or_else(|| rule.sensor_type.clone()),
            condition: self
                .condition
                .unwrap_or_else(|| rule.condition.as_str().to_string()),
            threshold_value: self.threshold_value.unwrap_or(rule.threshold_value),
            threshold_value_2: self.threshold_value_2.or(rule.threshold_value_2),
            duration_minutes: Some(self.duration_minutes.unwrap_or(rule.duration_minutes)),
            severity: Some(
                self.severity
                    .unwrap_or_else(|| rule.severity.as_str().to_string()),
            ),
            enabled: Some(self.enabled.unwrap_or(rule.enabled)),
        };

        let mut updated = input.into_rule(rule.tenant_id)?;
        updated.id = rule.id;
        updated.created_at = rule.created_at;
        Ok(updated)
    }
}
