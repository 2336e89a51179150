//! Virtual networks and their subnets.

use std::sync::Arc;

use cirrus_lro::{OperationStore, ResourceSpec, SpecError, SpecService, StatusUpdater};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::security_groups::SecurityGroupProperties;
use super::{ServiceSettings, build};
use crate::clients::{
    PutRequest, Resource, ResourceClient, ResourceKind, SimulatedCloud, resource_id,
};
use crate::config::{ClusterManifest, SubnetManifest};

pub const SERVICE_NAME: &str = "virtualnetworks";
pub const CONDITION: &str = "VNetReady";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkProperties {
    pub address_prefixes: Vec<IpNet>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub name: String,
    pub address_prefix: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_security_group_id: Option<String>,
}

impl ResourceKind for VirtualNetworkProperties {
    const RESOURCE_TYPE: &'static str = "Cirrus.Network/virtualNetworks";
}

pub type VirtualNetwork = Resource<VirtualNetworkProperties>;
pub type VirtualNetworksClient = ResourceClient<VirtualNetworkProperties>;

/// Desired state of one virtual network.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualNetworkSpec {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub address_prefixes: Vec<IpNet>,
    pub subnets: Vec<SubnetManifest>,
}

impl VirtualNetworkSpec {
    fn desired(&self) -> Result<VirtualNetworkProperties, SpecError> {
        if self.address_prefixes.is_empty() {
            return Err(SpecError::new(format!(
                "virtual network {} has no address prefixes",
                self.name
            )));
        }

        for (i, subnet) in self.subnets.iter().enumerate() {
            if !self
                .address_prefixes
                .iter()
                .any(|prefix| prefix.contains(&subnet.address_prefix))
            {
                return Err(SpecError::new(format!(
                    "subnet {} ({}) is outside the address space of {}",
                    subnet.name, subnet.address_prefix, self.name
                )));
            }
            if let Some(other) = self.subnets[..i]
                .iter()
                .find(|other| overlaps(&other.address_prefix, &subnet.address_prefix))
            {
                return Err(SpecError::new(format!(
                    "subnet {} ({}) overlaps subnet {} ({})",
                    subnet.name, subnet.address_prefix, other.name, other.address_prefix
                )));
            }
        }

        Ok(VirtualNetworkProperties {
            address_prefixes: self.address_prefixes.iter().map(IpNet::trunc).collect(),
            subnets: self
                .subnets
                .iter()
                .map(|subnet| Subnet {
                    name: subnet.name.clone(),
                    address_prefix: subnet.address_prefix.trunc(),
                    network_security_group_id: subnet.security_group.as_ref().map(|name| {
                        resource_id(
                            &self.resource_group,
                            SecurityGroupProperties::RESOURCE_TYPE,
                            name,
                        )
                    }),
                })
                .collect(),
        })
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

impl ResourceSpec for VirtualNetworkSpec {
    type Resource = VirtualNetwork;
    type Parameters = PutRequest<VirtualNetworkProperties>;

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    fn parameters(
        &self,
        existing: Option<&VirtualNetwork>,
    ) -> Result<Option<Self::Parameters>, SpecError> {
        let properties = self.desired()?;

        if let Some(existing) = existing
            && existing.properties == properties
            && existing.provisioning_state.is_succeeded()
        {
            return Ok(None);
        }

        let mut references: Vec<String> = properties
            .subnets
            .iter()
            .filter_map(|s| s.network_security_group_id.clone())
            .collect();
        references.sort();
        references.dedup();

        Ok(Some(PutRequest {
            location: self.location.clone(),
            references,
            properties,
        }))
    }
}

pub fn specs(manifest: &ClusterManifest) -> Vec<VirtualNetworkSpec> {
    manifest
        .network
        .virtual_networks
        .iter()
        .map(|vnet| VirtualNetworkSpec {
            name: vnet.name.clone(),
            resource_group: manifest.resource_group.clone(),
            location: manifest.location.clone(),
            address_prefixes: vnet.address_prefixes.clone(),
            subnets: vnet.subnets.clone(),
        })
        .collect()
}

pub fn service<St>(
    manifest: &ClusterManifest,
    cloud: &Arc<SimulatedCloud>,
    status: &Arc<St>,
    settings: ServiceSettings,
) -> SpecService<VirtualNetworkSpec, Arc<St>, VirtualNetworksClient, Arc<St>>
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
