//! End-to-end lifecycle against the simulated provider.
//!
//! Operations take longer than one pass, so every step goes through the status
//! file. Each step reopens the provider and status store from disk, like a
//! restarted agent would.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cirrus_agent::clients::{ProvisioningState, ResourceKind, resource_id};
use cirrus_agent::services::security_groups::{self, SecurityGroupProperties};
use cirrus_agent::services::virtual_networks::{self, VirtualNetworkProperties};
use cirrus_agent::services::{self, ServiceSettings};
use cirrus_agent::{
    AgentAuditLogger, AgentSettings, ClusterManifest, FileStatusStore, PassOutcome,
    ReconcileAgent, SimulatedCloud,
};
use cirrus_lro::ConditionStatus;
use tempfile::TempDir;

const LATENCY: Duration = Duration::from_millis(300);
const PASS_TIMEOUT: Duration = Duration::from_millis(100);
const WAIT: Duration = Duration::from_millis(400);

const MANIFEST: &str = r#"{
    "clusterName": "demo",
    "resourceGroup": "demo-rg",
    "location": "westeurope",
    "network": {
        "virtualNetworks": [{
            "name": "demo-vnet",
            "addressPrefixes": ["10.0.0.0/16"],
            "subnets": [
                {"name": "control-plane", "addressPrefix": "10.0.0.0/24", "securityGroup": "demo-cp-nsg"},
                {"name": "nodes", "addressPrefix": "10.0.1.0/24"}
            ]
        }]
    },
    "securityGroups": [{
        "name": "demo-cp-nsg",
        "rules": [{
            "name": "allow-apiserver",
            "priority": 100,
            "direction": "Inbound",
            "access": "Allow",
            "protocol": "Tcp",
            "destinationPortRange": "6443"
        }]
    }]
}"#;

struct Harness {
    _dir: TempDir,
    status_path: PathBuf,
    cloud_path: PathBuf,
    manifest: ClusterManifest,
}

/// One agent process: provider and status loaded from the harness files.
struct Instance {
    agent: ReconcileAgent,
    cloud: Arc<SimulatedCloud>,
    status: Arc<FileStatusStore>,
}

impl Harness {
    fn new(manifest: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let manifest_path = dir.path().join("cluster.json");
        std::fs::write(&manifest_path, manifest).unwrap();
        Self {
            status_path: dir.path().join("cluster.status.json"),
            cloud_path: dir.path().join("cloud.json"),
            manifest: ClusterManifest::load(&manifest_path).unwrap(),
            _dir: dir,
        }
    }

    fn start(&self, latency: Duration) -> Instance {
        let cloud = Arc::new(SimulatedCloud::open(&self.cloud_path, latency).unwrap());
        let status = Arc::new(FileStatusStore::open(&self.status_path).unwrap());
        let settings = ServiceSettings {
            timeout: PASS_TIMEOUT,
            requeue_after: Duration::from_secs(15),
            poll_interval: Duration::from_millis(20),
        };
        let agent = ReconcileAgent::new(
            services::for_manifest(&self.manifest, &cloud, &status, settings),
            AgentAuditLogger::new(&self.manifest.cluster_name),
            AgentSettings {
                timeout: PASS_TIMEOUT,
                once: true,
                ..AgentSettings::default()
            },
        );
        Instance {
            agent,
            cloud,
            status,
        }
    }
}

fn nsg_id() -> String {
    resource_id("demo-rg", SecurityGroupProperties::RESOURCE_TYPE, "demo-cp-nsg")
}

fn vnet_id() -> String {
    resource_id("demo-rg", VirtualNetworkProperties::RESOURCE_TYPE, "demo-vnet")
}

#[tokio::test]
async fn test_create_and_delete_across_restarts() {
    let harness = Harness::new(MANIFEST);

    // security group accepted but not finished within the pass
    let first = harness.start(LATENCY);
    let outcome = first.agent.reconcile_pass().await;
    assert!(matches!(outcome, PassOutcome::Requeue(d) if d == Duration::from_secs(15)));
    let status = first.status.snapshot();
    assert_eq!(status.long_running_operation_states.len(), 1);
    assert_eq!(
        status.long_running_operation_states[0].service_name,
        security_groups::SERVICE_NAME
    );
    let condition = status.get_condition(security_groups::CONDITION).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason.as_deref(), Some("Creating"));
    assert!(status.get_condition(virtual_networks::CONDITION).is_none());
    drop(first);

    // a restarted agent finishes the security group and starts the network
    tokio::time::sleep(WAIT).await;
    let second = harness.start(LATENCY);
    assert!(matches!(
        second.agent.reconcile_pass().await,
        PassOutcome::Requeue(_)
    ));
    let status = second.status.snapshot();
    assert!(status.get_condition(security_groups::CONDITION).unwrap().is_true());
    assert_eq!(status.long_running_operation_states.len(), 1);
    assert_eq!(
        status.long_running_operation_states[0].service_name,
        virtual_networks::SERVICE_NAME
    );
    drop(second);

    tokio::time::sleep(WAIT).await;
    let third = harness.start(LATENCY);
    assert!(third.agent.reconcile_pass().await.is_ready());
    let status = third.status.snapshot();
    assert!(status.long_running_operation_states.is_empty());
    assert!(status.get_condition(virtual_networks::CONDITION).unwrap().is_true());
    let vnet = third.cloud.get(&vnet_id()).unwrap();
    assert_eq!(vnet.references, vec![nsg_id()]);

    // no drift: nothing is sent, so the etags stay put
    let nsg_etag = third.cloud.get(&nsg_id()).unwrap().etag;
    assert!(third.agent.reconcile_pass().await.is_ready());
    assert_eq!(third.cloud.get(&nsg_id()).unwrap().etag, nsg_etag);
    assert_eq!(third.cloud.get(&vnet_id()).unwrap().etag, vnet.etag);
    drop(third);

    // delete in reverse order: the network must go before its security group
    let fourth = harness.start(LATENCY);
    assert!(matches!(
        fourth.agent.delete_pass().await,
        PassOutcome::Requeue(_)
    ));
    let status = fourth.status.snapshot();
    assert_eq!(
        status
            .get_condition(virtual_networks::CONDITION)
            .unwrap()
            .reason
            .as_deref(),
        Some("Deleting")
    );
    assert!(fourth.cloud.get(&nsg_id()).is_ok());
    drop(fourth);

    tokio::time::sleep(WAIT).await;
    let fifth = harness.start(LATENCY);
    assert!(matches!(
        fifth.agent.delete_pass().await,
        PassOutcome::Requeue(_)
    ));
    assert!(fifth.cloud.get(&vnet_id()).unwrap_err().is_not_found());
    drop(fifth);

    tokio::time::sleep(WAIT).await;
    let sixth = harness.start(LATENCY);
    assert!(sixth.agent.delete_pass().await.is_ready());
    assert!(sixth.cloud.list(None).is_empty());
    let status = sixth.status.snapshot();
    assert!(status.long_running_operation_states.is_empty());
    for condition in [security_groups::CONDITION, virtual_networks::CONDITION] {
        let condition = status.get_condition(condition).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason.as_deref(), Some("Deleted"));
    }

    // deleting again is a no-op
    assert!(sixth.agent.delete_pass().await.is_ready());
}

#[tokio::test]
async fn test_fast_provider_is_ready_in_one_pass() {
    let harness = Harness::new(MANIFEST);
    let instance = harness.start(Duration::ZERO);

    let summary = instance.agent.run(cirrus_agent::Action::Reconcile).await;
    assert!(summary.last.is_ready());
    assert_eq!(summary.passes, 1);
    assert_eq!(instance.cloud.list(None).len(), 2);
}

#[tokio::test]
async fn test_provider_failure_is_reported() {
    let harness = Harness::new(MANIFEST);
    let instance = harness.start(Duration::ZERO);
    instance.cloud.inject_failure(&nsg_id(), "quota exceeded");

    let err = match instance.agent.reconcile_pass().await {
        PassOutcome::Failed(err) => err,
        other => panic!("expected a failed pass, got {other:?}"),
    };
    assert!(err.to_string().contains("quota exceeded"));

    let status = instance.status.snapshot();
    let condition = status.get_condition(security_groups::CONDITION).unwrap();
    assert_eq!(condition.reason.as_deref(), Some("Failed"));
    assert!(condition.message.as_deref().unwrap().contains("quota exceeded"));
    assert!(status.long_running_operation_states.is_empty());

    // the next pass puts the failed group again and succeeds
    assert!(instance.agent.reconcile_pass().await.is_ready());
}

#[tokio::test]
async fn test_reconcile_during_unfinished_delete_is_not_ready() {
    let harness = Harness::new(MANIFEST);
    let first = harness.start(Duration::ZERO);
    assert!(first.agent.reconcile_pass().await.is_ready());
    drop(first);

    // the network delete is accepted but outlives the pass
    let second = harness.start(Duration::from_secs(3600));
    assert!(matches!(
        second.agent.delete_pass().await,
        PassOutcome::Requeue(_)
    ));
    drop(second);

    let third = harness.start(Duration::from_secs(3600));
    for _ in 0..2 {
        let err = match third.agent.reconcile_pass().await {
            PassOutcome::Failed(err) => err,
            other => panic!("expected a failed pass, got {other:?}"),
        };
        assert!(err.to_string().contains("demo-vnet"));
    }

    let status = third.status.snapshot();
    assert!(status.get_condition(security_groups::CONDITION).unwrap().is_true());
    let condition = status.get_condition(virtual_networks::CONDITION).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason.as_deref(), Some("Failed"));
    assert!(condition.message.as_deref().unwrap().contains("in progress"));

    // the delete is still tracked and still running
    assert_eq!(status.long_running_operation_states.len(), 1);
    assert_eq!(
        status.long_running_operation_states[0].service_name,
        virtual_networks::SERVICE_NAME
    );
    assert_eq!(
        status.long_running_operation_states[0].kind,
        cirrus_lro::OperationKind::Delete
    );
    assert_eq!(
        third.cloud.get(&vnet_id()).unwrap().provisioning_state,
        ProvisioningState::Deleting
    );
}

#[tokio::test]
async fn test_unmanaged_network_is_left_alone() {
    let manifest = MANIFEST.replace(
        r#""network": {"#,
        r#""network": {
        "managed": false,"#,
    );
    let harness = Harness::new(&manifest);
    let instance = harness.start(Duration::ZERO);

    assert!(instance.agent.reconcile_pass().await.is_ready());
    assert!(instance.agent.delete_pass().await.is_ready());
    assert!(instance.cloud.list(None).is_empty());
    assert!(instance.status.snapshot().conditions.is_empty());
}
