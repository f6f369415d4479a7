//! Test helpers for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use caps_controller::api::{CLUSTER_NAME_LABEL, Object, OwnerMachine};
use caps_controller::controller::{
    ClusterController, MachineController, ManagedClusterController, ManagedControlPlaneController,
    ManagedMachinePoolController,
};
use caps_controller::test_util::fixtures::NAMESPACE;
use caps_controller::test_util::{InMemoryCloud, MemoryKubeconfigs, MemoryStore};
use caps_controller::{Action, Context, ControllerConfig, telemetry};
use tokio_util::sync::CancellationToken;

/// Controllers wired to one in-memory cloud and object store.
pub struct Harness {
    pub cloud: Arc<InMemoryCloud>,
    pub store: Arc<MemoryStore>,
    pub kubeconfigs: Arc<MemoryKubeconfigs>,
    pub token: CancellationToken,
    pub clusters: ClusterController,
    pub machines: MachineController,
    pub managed_clusters: ManagedClusterController,
    pub control_planes: ManagedControlPlaneController,
    pub pools: ManagedMachinePoolController,
}

impl Harness {
    pub fn new() -> Self {
        telemetry::init("caps_controller=debug");

        let cloud = InMemoryCloud::new();
        let store = MemoryStore::new();
        let kubeconfigs = MemoryKubeconfigs::new();
        let ctx = Arc::new(Context::new(
            cloud.clone(),
            store.clone(),
            kubeconfigs.clone(),
            ControllerConfig::default(),
        ));

        Self {
            clusters: ClusterController::new(ctx.clone(), store.clone()),
            machines: MachineController::new(ctx.clone(), store.clone()),
            managed_clusters: ManagedClusterController::new(ctx.clone(), store.clone()),
            control_planes: ManagedControlPlaneController::new(ctx.clone(), store.clone()),
            pools: ManagedMachinePoolController::new(ctx, store.clone()),
            cloud,
            store,
            kubeconfigs,
            token: CancellationToken::new(),
        }
    }

    /// Register the Machine owning `name` and its bootstrap data.
    pub fn add_owner_machine(&self, name: &str, cluster_name: &str, control_plane: bool) {
        let secret = format!("{}-bootstrap", name);
        self.store.set_owner_machine(
            NAMESPACE,
            OwnerMachine {
                name: name.to_string(),
                cluster_name: cluster_name.to_string(),
                control_plane,
                failure_domain: None,
                bootstrap_data_secret: Some(secret.clone()),
            },
        );
        self.store.set_bootstrap_data(NAMESPACE, &secret, b"#cloud-config");
    }
}

/// Point `object` at the cluster named `cluster_name`.
pub fn belongs_to<T: Object>(mut object: T, cluster_name: &str) -> T {
    object
        .meta_mut()
        .labels
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
    object
}

/// Whether `action` asks to come back later.
pub fn is_requeue(action: &Action) -> bool {
    action.requeue_after().is_some()
}
