//! Test utilities: an in-memory provider, object stores and fixtures.
//!
//! Used by unit tests inside the crate and by the integration tests under
//! `tests/`.

pub mod cloud;
pub mod fixtures;
pub mod store;

use std::sync::Arc;

pub use cloud::InMemoryCloud;
pub use store::{MemoryKubeconfigs, MemoryStore, RecordingSink};

use crate::api::{
    OwnerMachine, ScalewayCluster, ScalewayMachine, ScalewayManagedCluster,
    ScalewayManagedControlPlane, ScalewayManagedMachinePool,
};
use crate::config::ControllerConfig;
use crate::controller::KubeconfigSink;
use crate::scope::{
    ClusterScope, MachineScope, ManagedClusterScope, ManagedControlPlaneScope,
    ManagedMachinePoolScope,
};

/// Bootstrap data handed to every machine scope.
pub const BOOTSTRAP_DATA: &[u8] = b"#cloud-config";

fn config() -> Arc<ControllerConfig> {
    Arc::new(ControllerConfig::default())
}

pub fn cluster_scope(cloud: &Arc<InMemoryCloud>, cluster: ScalewayCluster) -> ClusterScope {
    ClusterScope::new(cluster, cloud.clone(), RecordingSink::<ScalewayCluster>::new(), config())
}

/// Scope of a machine owned by a Machine of `cluster`.
pub fn machine_scope(
    cloud: &Arc<InMemoryCloud>,
    machine: ScalewayMachine,
    cluster: ScalewayCluster,
    control_plane: bool,
) -> MachineScope {
    let owner = OwnerMachine {
        name: machine.meta.name.clone(),
        cluster_name: cluster.meta.name.clone(),
        control_plane,
        failure_domain: None,
        bootstrap_data_secret: Some(format!("{}-bootstrap", machine.meta.name)),
    };
    MachineScope::new(
        machine,
        owner,
        cluster,
        Some(BOOTSTRAP_DATA.to_vec()),
        cloud.clone(),
        RecordingSink::<ScalewayMachine>::new(),
        config(),
    )
}

pub fn managed_cluster_scope(
    cloud: &Arc<InMemoryCloud>,
    managed_cluster: ScalewayManagedCluster,
) -> ManagedClusterScope {
    ManagedClusterScope::new(
        managed_cluster,
        cloud.clone(),
        RecordingSink::<ScalewayManagedCluster>::new(),
        config(),
    )
}

pub fn control_plane_scope<K: KubeconfigSink + 'static>(
    cloud: &Arc<InMemoryCloud>,
    control_plane: ScalewayManagedControlPlane,
    managed_cluster: ScalewayManagedCluster,
    kubeconfigs: Arc<K>,
) -> ManagedControlPlaneScope {
    ManagedControlPlaneScope::new(
        control_plane,
        managed_cluster,
        cloud.clone(),
        RecordingSink::<ScalewayManagedControlPlane>::new(),
        kubeconfigs,
        config(),
    )
}

pub fn pool_scope(
    cloud: &Arc<InMemoryCloud>,
    pool: ScalewayManagedMachinePool,
    control_plane: ScalewayManagedControlPlane,
    managed_cluster: ScalewayManagedCluster,
) -> ManagedMachinePoolScope {
    ManagedMachinePoolScope::new(
        pool,
        control_plane,
        managed_cluster,
        cloud.clone(),
        RecordingSink::<ScalewayManagedMachinePool>::new(),
        config(),
    )
}
