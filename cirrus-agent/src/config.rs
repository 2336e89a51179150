//! Cluster manifest: the desired network state of one cluster.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("subnet {subnet} references unknown security group {security_group}")]
    UnknownSecurityGroup {
        subnet: String,
        security_group: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManifest {
    pub cluster_name: String,
    pub resource_group: String,
    pub location: String,
    #[serde(default)]
    pub network: NetworkManifest,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkManifest {
    /// Whether the agent owns the network resources. Unmanaged networks are
    /// brought by the user and never touched.
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub virtual_networks: Vec<VirtualNetworkManifest>,
}

impl Default for NetworkManifest {
    fn default() -> Self {
        Self {
            managed: default_managed(),
            virtual_networks: Vec::new(),
        }
    }
}

fn default_managed() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkManifest {
    pub name: String,
    pub address_prefixes: Vec<IpNet>,
    #[serde(default)]
    pub subnets: Vec<SubnetManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetManifest {
    pub name: String,
    pub address_prefix: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupManifest {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[serde(rename = "*")]
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    pub name: String,
    pub priority: u32,
    pub direction: Direction,
    pub access: Access,
    pub protocol: Protocol,
    #[serde(default = "any")]
    pub source_prefix: String,
    #[serde(default = "any")]
    pub destination_port_range: String,
}

fn any() -> String {
    "*".to_string()
}

impl ClusterManifest {
    /// Load and validate a manifest from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: ClusterManifest = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        manifest
            .validate()
            .with_context(|| format!("Invalid manifest {}", path.display()))?;
        Ok(manifest)
    }

    /// Structural checks. Address and rule checks happen when parameters are built.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.cluster_name.is_empty() {
            return Err(ManifestError::Empty {
                field: "clusterName",
            });
        }
        if self.resource_group.is_empty() {
            return Err(ManifestError::Empty {
                field: "resourceGroup",
            });
        }
        if self.location.is_empty() {
            return Err(ManifestError::Empty { field: "location" });
        }

        let groups = unique_names(
            "security group",
            self.security_groups.iter().map(|g| g.name.as_str()),
        )?;
        unique_names(
            "virtual network",
            self.network.virtual_networks.iter().map(|v| v.name.as_str()),
        )?;

        for vnet in &self.network.virtual_networks {
            unique_names("subnet", vnet.subnets.iter().map(|s| s.name.as_str()))?;
            for subnet in &vnet.subnets {
                if let Some(sg) = &subnet.security_group
                    && !groups.contains(sg.as_str())
                {
                    return Err(ManifestError::UnknownSecurityGroup {
                        subnet: subnet.name.clone(),
                        security_group: sg.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, ManifestError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ManifestError::Empty { field: "name" });
        }
        if !seen.insert(name) {
            return Err(ManifestError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(seen)
}
