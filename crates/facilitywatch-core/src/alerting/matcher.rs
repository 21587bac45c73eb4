//! Rule to sensor matching

use std::collections::HashMap;

use crate::models::{AlertRule, RuleScope, Sensor};

/// A tenant's sensors grouped by sensor type
#[derive(Debug, Default)]
pub struct SensorIndex {
    by_type: HashMap<String, Vec<Sensor>>,
}

impl SensorIndex {
    /// Build an index from a sensor listing
    pub fn new(sensors: impl IntoIterator<Item = Sensor>) -> Self {
        let mut by_type: HashMap<String, Vec<Sensor>> = HashMap::new();
        for sensor in sensors {
            by_type
                .entry(sensor.sensor_type.clone())
                .or_default()
                .push(sensor);
        }
        Self { by_type }
    }

    /// Sensors a rule applies to: matching sensor type, inside the rule's
    /// tenant, and within its asset / asset-type / tenant-wide scope.
    pub fn matching<'a>(&'a self, rule: &AlertRule) -> Vec<&'a Sensor> {
        let Some(candidates) = self.by_type.get(&rule.sensor_type) else {
            return Vec::new();
        };

        let scope = rule.scope();
        candidates
            .iter()
            .filter(|sensor| sensor.tenant_id == rule.tenant_id)
            .filter(|sensor| match scope {
                RuleScope::Asset(asset_id) => sensor.asset_id == asset_id,
                RuleScope::AssetType(type_id) => sensor.asset_type_id == type_id,
                RuleScope::Tenant => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertRuleInput;
    use uuid::Uuid;

    struct Fixture {
        tenant: Uuid,
        chiller_type: Uuid,
        chiller_1: Uuid,
        chiller_2: Uuid,
        ahu: Uuid,
        index: SensorIndex,
    }

    fn sensor(tenant: Uuid, asset: Uuid, asset_type: Uuid, sensor_type: &str) -> Sensor {
        Sensor {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            asset_id: asset,
            asset_type_id: asset_type,
            asset_name: "asset".to_string(),
            name: format!("{sensor_type} sensor"),
            sensor_type: sensor_type.to_string(),
            unit: "F".to_string(),
        }
    }

    fn fixture() -> Fixture {
        let tenant = Uuid::new_v4();
        let other_tenant = Uuid::new_v4();
        let chiller_type = Uuid::new_v4();
        let ahu_type = Uuid::new_v4();
        let chiller_1 = Uuid::new_v4();
        let chiller_2 = Uuid::new_v4();
        let ahu = Uuid::new_v4();

        let index = SensorIndex::new(vec![
            sensor(tenant, chiller_1, chiller_type, "temperature"),
            sensor(tenant, chiller_1, chiller_type, "power"),
            sensor(tenant, chiller_2, chiller_type, "temperature"),
            sensor(tenant, ahu, ahu_type, "temperature"),
            sensor(other_tenant, Uuid::new_v4(), chiller_type, "temperature"),
        ]);

        Fixture {
            tenant,
            chiller_type,
            chiller_1,
            chiller_2,
            ahu,
            index,
        }
    }

    fn rule(tenant: Uuid, asset_id: Option<Uuid>, asset_type_id: Option<Uuid>) -> AlertRule {
        AlertRuleInput {
            name: None,
            asset_type_id,
            asset_id,
            sensor_type: "temperature".to_string(),
            condition: "gt".to_string(),
            threshold_value: 80.0,
            threshold_value_2: None,
            duration_minutes: Some(0),
            severity: None,
            enabled: None,
        }
        .into_rule(tenant)
        .unwrap()
    }

    #[test]
    fn test_asset_scope() {
        let f = fixture();
        let matched = f.index.matching(&rule(f.tenant, Some(f.chiller_1), None));

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].asset_id, f.chiller_1);
        assert_eq!(matched[0].sensor_type, "temperature");
    }

    #[test]
    fn test_asset_type_scope() {
        let f = fixture();
        let matched = f.index.matching(&rule(f.tenant, None, Some(f.chiller_type)));

        let mut assets: Vec<Uuid> = matched.iter().map(|s| s.asset_id).collect();
        assets.sort();
        let mut expected = vec![f.chiller_1, f.chiller_2];
        expected.sort();
        assert_eq!(assets, expected);
    }

    #[test]
    fn test_tenant_scope_excludes_other_tenants() {
        let f = fixture();
        let matched = f.index.matching(&rule(f.tenant, None, None));

        assert_eq!(matched.len(), 3);
        assert!(matched.iter().any(|s| s.asset_id == f.ahu));
        assert!(matched.iter().all(|s| s.tenant_id == f.tenant));
    }

    #[test]
    fn test_unknown_sensor_type() {
        let f = fixture();
        let mut rule = rule(f.tenant, None, None);
        rule.sensor_type = "humidity".to_string();

        assert!(f.index.matching(&rule).is_empty());
    }
}
