//! Objects with the smallest valid specs, plus helpers that bring their
//! provider resources up.

use std::sync::Arc;

use crate::api::{
    ApiEndpoint, CLUSTER_NAME_LABEL, ImageSpec, ManagedNetworkSpec, NetworkSpec, ObjectMeta,
    PrivateNetworkSpec, ScalewayCluster, ScalewayClusterSpec, ScalewayMachine,
    ScalewayMachineSpec, ScalewayManagedCluster, ScalewayManagedClusterSpec,
    ScalewayManagedControlPlane, ScalewayManagedControlPlaneSpec, ScalewayManagedMachinePool,
    ScalewayManagedMachinePoolSpec,
};
use crate::clients::{Region, Zone};
use crate::error::{Outcome, classify};
use crate::reconciler::{
    Orchestrator, cluster_orchestrator, managed_cluster_orchestrator,
    managed_control_plane_orchestrator,
};

use super::{
    InMemoryCloud, MemoryKubeconfigs, cluster_scope, control_plane_scope, managed_cluster_scope,
};

pub const NAMESPACE: &str = "default";
pub const PROJECT_ID: &str = "11111111-2222-3333-4444-555555555555";
pub const SECRET_NAME: &str = "scaleway-credentials";

pub fn region() -> Region {
    Region::parse("fr-par").expect("known region")
}

pub fn zone() -> Zone {
    region().default_zone()
}

fn labelled(name: &str, cluster_name: &str) -> ObjectMeta {
    let mut meta = ObjectMeta::new(NAMESPACE, name);
    meta.labels
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
    meta
}

/// Cluster with a managed private network and nothing else.
pub fn cluster(name: &str) -> ScalewayCluster {
    ScalewayCluster {
        meta: labelled(name, name),
        spec: ScalewayClusterSpec {
            project_id: PROJECT_ID.to_string(),
            region: region(),
            scaleway_secret_name: SECRET_NAME.to_string(),
            network: NetworkSpec {
                private_network: PrivateNetworkSpec {
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            failure_domains: Vec::new(),
            control_plane_endpoint: ApiEndpoint::default(),
        },
        status: Default::default(),
    }
}

pub fn machine(name: &str) -> ScalewayMachine {
    ScalewayMachine {
        meta: ObjectMeta::new(NAMESPACE, name),
        spec: ScalewayMachineSpec {
            commercial_type: "DEV1-S".to_string(),
            image: ImageSpec {
                id: None,
                name: Some(super::cloud::IMAGE_NAME.to_string()),
            },
            ..Default::default()
        },
        status: Default::default(),
    }
}

pub fn managed_cluster(name: &str) -> ScalewayManagedCluster {
    ScalewayManagedCluster {
        meta: labelled(name, name),
        spec: ScalewayManagedClusterSpec {
            project_id: PROJECT_ID.to_string(),
            region: region(),
            scaleway_secret_name: SECRET_NAME.to_string(),
            network: ManagedNetworkSpec {
                private_network: PrivateNetworkSpec {
                    enabled: true,
                    ..Default::default()
                },
                public_gateways: Vec::new(),
            },
            control_plane_endpoint: ApiEndpoint::default(),
        },
        status: Default::default(),
    }
}

pub fn control_plane(name: &str, version: &str) -> ScalewayManagedControlPlane {
    ScalewayManagedControlPlane {
        meta: labelled(name, name),
        spec: ScalewayManagedControlPlaneSpec {
            cluster_name: None,
            cluster_type: "kapsule".to_string(),
            version: version.to_string(),
            cni: "cilium".to_string(),
            additional_tags: Vec::new(),
            feature_gates: Vec::new(),
            admission_plugins: Vec::new(),
            apiserver_cert_sans: Vec::new(),
            autoscaler: Default::default(),
            auto_upgrade: Default::default(),
            on_delete: Default::default(),
            control_plane_endpoint: ApiEndpoint::default(),
        },
        status: Default::default(),
    }
}

pub fn pool(name: &str, node_type: &str, replicas: u32) -> ScalewayManagedMachinePool {
    ScalewayManagedMachinePool {
        meta: ObjectMeta::new(NAMESPACE, name),
        spec: ScalewayManagedMachinePoolSpec {
            node_type: node_type.to_string(),
            replicas: Some(replicas),
            ..Default::default()
        },
        status: Default::default(),
    }
}

/// Run `orchestrator` until it succeeds, tolerating transient errors.
async fn converge<S: Send>(orchestrator: &Orchestrator<S>, scope: &mut S) {
    for _ in 0..5 {
        match orchestrator.reconcile(scope).await {
            Ok(()) => return,
            Err(e) if matches!(classify(&e), Outcome::Transient(_)) => continue,
            Err(e) => panic!("reconciliation failed: {:#}", e),
        }
    }
    panic!("reconciliation did not converge");
}

/// Cluster whose network and load balancer exist, marked ready.
pub async fn ready_cluster(cloud: &Arc<InMemoryCloud>, name: &str) -> ScalewayCluster {
    let mut scope = cluster_scope(cloud, cluster(name));
    converge(&cluster_orchestrator(), &mut scope).await;
    scope.set_ready(true);
    scope.close().await.expect("status persists");
    scope.cluster().clone()
}

pub async fn ready_managed_cluster(
    cloud: &Arc<InMemoryCloud>,
    name: &str,
) -> ScalewayManagedCluster {
    let mut scope = managed_cluster_scope(cloud, managed_cluster(name));
    converge(&managed_cluster_orchestrator(), &mut scope).await;
    scope.set_ready(true);
    scope.close().await.expect("status persists");
    scope.managed_cluster().clone()
}

/// Control plane whose provider cluster is up, marked ready.
pub async fn ready_control_plane(
    cloud: &Arc<InMemoryCloud>,
    managed: &ScalewayManagedCluster,
    name: &str,
    version: &str,
) -> ScalewayManagedControlPlane {
    let mut scope = control_plane_scope(
        cloud,
        control_plane(name, version),
        managed.clone(),
        MemoryKubeconfigs::new(),
    );
    converge(&managed_control_plane_orchestrator(), &mut scope).await;
    scope.set_ready(true);
    scope.close().await.expect("status persists");
    scope.control_plane().clone()
}
