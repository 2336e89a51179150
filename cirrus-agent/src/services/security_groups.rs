//! Network security groups.

use std::collections::HashSet;
use std::sync::Arc;

use cirrus_lro::{OperationStore, ResourceSpec, SpecError, SpecService, StatusUpdater};
use serde::{Deserialize, Serialize};

use super::{ServiceSettings, build};
use crate::clients::{PutRequest, Resource, ResourceClient, ResourceKind, SimulatedCloud};
use crate::config::{ClusterManifest, SecurityRule};

pub const SERVICE_NAME: &str = "securitygroups";
pub const CONDITION: &str = "SecurityGroupsReady";

const MIN_PRIORITY: u32 = 100;
const MAX_PRIORITY: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupProperties {
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
}

impl ResourceKind for SecurityGroupProperties {
    const RESOURCE_TYPE: &'static str = "Cirrus.Network/networkSecurityGroups";
}

pub type SecurityGroup = Resource<SecurityGroupProperties>;
pub type SecurityGroupsClient = ResourceClient<SecurityGroupProperties>;

/// Desired state of one security group.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub rules: Vec<SecurityRule>,
}

impl SecurityGroupSpec {
    fn validate(&self) -> Result<(), SpecError> {
        let mut names = HashSet::new();
        let mut priorities = HashSet::new();
        for rule in &self.rules {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&rule.priority) {
                return Err(SpecError::new(format!(
                    "rule {} has priority {}, must be between {MIN_PRIORITY} and {MAX_PRIORITY}",
                    rule.name, rule.priority
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(SpecError::new(format!("duplicate rule name {}", rule.name)));
            }
            if !priorities.insert((rule.direction, rule.priority)) {
                return Err(SpecError::new(format!(
                    "rule {} reuses priority {} for {:?} traffic",
                    rule.name, rule.priority, rule.direction
                )));
            }
            validate_port_range(&rule.destination_port_range)
                .map_err(|e| SpecError::new(format!("rule {}: {e}", rule.name)))?;
        }
        Ok(())
    }
}

fn validate_port_range(range: &str) -> Result<(), String> {
    if range == "*" {
        return Ok(());
    }
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| format!("invalid port {s:?}"))
    };
    match range.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(format!("port range {range} is reversed"));
            }
            Ok(())
        }
        None => parse(range).map(|_| ()),
    }
}

impl ResourceSpec for SecurityGroupSpec {
    type Resource = SecurityGroup;
    type Parameters = PutRequest<SecurityGroupProperties>;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    /// Rules found on the existing group but not in the manifest are kept, so
    /// rules added out of band survive. Same-named rules are overwritten. A group
    /// that is not `Succeeded` is put again even without drift.
    fn parameters(
        &self,
        existing: Option<&SecurityGroup>,
    ) -> Result<Option<Self::Parameters>, SpecError> {
        self.validate()?;

        let mut rules = self.rules.clone();
        if let Some(existing) = existing {
            let current = &existing.properties.security_rules;
            let up_to_date = self.rules.iter().all(|rule| current.contains(rule));
            if up_to_date && existing.provisioning_state.is_succeeded() {
                return Ok(None);
            }
            let desired: HashSet<&str> = self.rules.iter().map(|r| r.name.as_str()).collect();
            rules.extend(
                current
                    .iter()
                    .filter(|r| !desired.contains(r.name.as_str()))
                    .cloned(),
            );
        }

        Ok(Some(PutRequest {
            location: self.location.clone(),
            references: Vec::new(),
            properties: SecurityGroupProperties {
                security_rules: rules,
            },
        }))
    }
}

pub fn specs(manifest: &ClusterManifest) -> Vec<SecurityGroupSpec> {
    manifest
        .security_groups
        .iter()
        .map(|group| SecurityGroupSpec {
            name: group.name.clone(),
            resource_group: manifest.resource_group.clone(),
            location: manifest.location.clone(),
            rules: group.rules.clone(),
        })
        .collect()
}

pub fn service<St>(
    manifest: &ClusterManifest,
    cloud: &Arc<SimulatedCloud>,
    status: &Arc<St>,
    settings: ServiceSettings,
) -> SpecService<SecurityGroupSpec, Arc<St>, SecurityGroupsClient, Arc<St>>
where
    St: OperationStore + StatusUpdater,
{
    build(
        SERVICE_NAME,
        CONDITION,
        specs(manifest),
        manifest.network.managed,
        cloud,
        status,
        settings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ProvisioningState;
    use crate::config::tests::manifest;
    use crate::config::{Access, Direction, Protocol};

    fn rule(name: &str, priority: u32) -> SecurityRule {
        SecurityRule {
            name: name.to_string(),
            priority,
            direction: Direction::Inbound,
            access: Access::Allow,
            protocol: Protocol::Tcp,
            source_prefix: "*".to_string(),
            destination_port_range: "22".to_string(),
        }
    }

    fn spec(rules: Vec<SecurityRule>) -> SecurityGroupSpec {
        SecurityGroupSpec {
            name: "nsg".to_string(),
            resource_group: "rg".to_string(),
            location: "westeurope".to_string(),
            rules,
        }
    }

    fn existing(rules: Vec<SecurityRule>) -> SecurityGroup {
        Resource {
            id: "nsg-id".to_string(),
            name: "nsg".to_string(),
            resource_group: "rg".to_string(),
            resource_type: SecurityGroupProperties::RESOURCE_TYPE.to_string(),
            location: "westeurope".to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            etag: "etag".to_string(),
            references: Vec::new(),
            properties: SecurityGroupProperties {
                security_rules: rules,
            },
        }
    }

    #[test]
    fn test_new_group_gets_all_rules() {
        let params = spec(vec![rule("ssh", 100)]).parameters(None).unwrap().unwrap();
        assert_eq!(params.properties.security_rules, vec![rule("ssh", 100)]);
        assert!(params.references.is_empty());
    }

    #[test]
    fn test_no_drift_needs_no_request() {
        let existing = existing(vec![rule("ssh", 100), rule("manual", 200)]);
        let params = spec(vec![rule("ssh", 100)]).parameters(Some(&existing)).unwrap();
        assert!(params.is_none());
    }

    #[test]
    fn test_failed_group_is_put_again() {
        let mut existing = existing(vec![rule("ssh", 100)]);
        existing.provisioning_state = ProvisioningState::Failed;
        let params = spec(vec![rule("ssh", 100)]).parameters(Some(&existing)).unwrap();
        assert!(params.is_some());
    }

    #[test]
    fn test_unsettled_group_is_put_again() {
        for state in [
            ProvisioningState::Creating,
            ProvisioningState::Updating,
            ProvisioningState::Deleting,
        ] {
            let mut existing = existing(vec![rule("ssh", 100)]);
            existing.provisioning_state = state;
            let params = spec(vec![rule("ssh", 100)]).parameters(Some(&existing)).unwrap();
            assert!(params.is_some(), "{state:?} group counted as up to date");
        }
    }

    #[test]
    fn test_drift_keeps_extra_rules() {
        let existing = existing(vec![rule("ssh", 300), rule("manual", 200)]);
        let params = spec(vec![rule("ssh", 100)])
            .parameters(Some(&existing))
            .unwrap()
            .unwrap();
        assert_eq!(
            params.properties.security_rules,
            vec![rule("ssh", 100), rule("manual", 200)]
        );
    }

    #[test]
    fn test_invalid_rules() {
        let err = spec(vec![rule("low", 99)]).parameters(None).unwrap_err();
        assert!(err.to_string().contains("must be between 100 and 4096"));

        let err = spec(vec![rule("a", 100), rule("a", 101)])
            .parameters(None)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate rule name a"));

        let err = spec(vec![rule("a", 100), rule("b", 100)])
            .parameters(None)
            .unwrap_err();
        assert!(err.to_string().contains("reuses priority 100"));

        let mut bad_port = rule("ports", 100);
        bad_port.destination_port_range = "9000-80".to_string();
        let err = spec(vec![bad_port]).parameters(None).unwrap_err();
        assert!(err.to_string().contains("reversed"));
    }

    #[test]
    fn test_port_ranges() {
        assert!(validate_port_range("*").is_ok());
        assert!(validate_port_range("443").is_ok());
        assert!(validate_port_range("30000-32767").is_ok());
        assert!(validate_port_range("0").is_err());
        assert!(validate_port_range("http").is_err());
    }

    #[test]
    fn test_specs_from_manifest() {
        let specs = specs(&manifest());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].resource_name(), "demo-cp-nsg");
        assert_eq!(specs[0].resource_group_name(), "demo-rg");
        assert_eq!(specs[0].rules.len(), 1);
    }
}
