//! Managed Kubernetes lifecycle: network, control plane and pools.

mod common;

use std::time::Duration;

use caps_controller::Action;
use caps_controller::api::{
    Object, ScalewayManagedCluster, ScalewayManagedControlPlane, ScalewayManagedMachinePool,
};
use caps_controller::clients::{K8sApi, VpcApi};
use caps_controller::test_util::fixtures::{self, NAMESPACE};
use tokio_test::assert_ok;

use common::{Harness, belongs_to, is_requeue};

const CLUSTER: &str = "mc1";

impl Harness {
    async fn reconcile_managed(&self) -> Action {
        let cluster = self
            .store
            .get::<ScalewayManagedCluster>(NAMESPACE, CLUSTER)
            .expect("managed cluster exists");
        assert_ok!(self.managed_clusters.reconcile(cluster, &self.token).await)
    }

    async fn reconcile_control_plane(&self) -> Action {
        let control_plane = self
            .store
            .get::<ScalewayManagedControlPlane>(NAMESPACE, "cp1")
            .expect("control plane exists");
        assert_ok!(self.control_planes.reconcile(control_plane, &self.token).await)
    }

    async fn reconcile_pool(&self) -> Action {
        let pool = self
            .store
            .get::<ScalewayManagedMachinePool>(NAMESPACE, "p1")
            .expect("pool exists");
        assert_ok!(self.pools.reconcile(pool, &self.token).await)
    }

    fn insert_objects(&self) {
        self.store.insert(&fixtures::managed_cluster(CLUSTER));
        self.store
            .insert(&belongs_to(fixtures::control_plane("cp1", "1.30.2"), CLUSTER));
        self.store
            .insert(&belongs_to(fixtures::pool("p1", "DEV1-M", 2), CLUSTER));
    }

    /// Bring every object to ready.
    async fn provision(&self) {
        self.insert_objects();
        assert_eq!(self.reconcile_managed().await, Action::await_change());
        for _ in 0..5 {
            if !is_requeue(&self.reconcile_control_plane().await) {
                break;
            }
        }
        for _ in 0..5 {
            if !is_requeue(&self.reconcile_pool().await) {
                break;
            }
        }
        assert_eq!(self.reconcile_managed().await, Action::await_change());
    }
}

#[tokio::test]
async fn test_dependents_wait_for_dependencies() {
    let h = Harness::new();
    h.insert_objects();

    assert_eq!(h.reconcile_pool().await, Action::requeue(Duration::from_secs(5)));
    assert_eq!(h.reconcile_control_plane().await, Action::requeue(Duration::from_secs(5)));

    let control_plane: ScalewayManagedControlPlane = h.store.get(NAMESPACE, "cp1").unwrap();
    assert!(control_plane.meta.has_finalizer(ScalewayManagedControlPlane::FINALIZER));
    assert!(!control_plane.status.ready);
    assert_eq!(h.cloud.mutating_calls(), 0);
}

#[tokio::test]
async fn test_provision() {
    let h = Harness::new();

    h.provision().await;

    let control_plane: ScalewayManagedControlPlane = h.store.get(NAMESPACE, "cp1").unwrap();
    assert!(control_plane.status.ready);
    assert!(control_plane.status.initialized);
    assert!(h.kubeconfigs.get(NAMESPACE, CLUSTER).is_some());

    let pool: ScalewayManagedMachinePool = h.store.get(NAMESPACE, "p1").unwrap();
    assert!(pool.status.ready);
    assert_eq!(pool.status.replicas, 2);
    assert_eq!(pool.spec.provider_id_list.len(), 2);

    let managed: ScalewayManagedCluster = h.store.get(NAMESPACE, CLUSTER).unwrap();
    assert!(managed.status.ready);
    assert_eq!(managed.spec.control_plane_endpoint, control_plane.spec.control_plane_endpoint);
    assert_eq!(managed.spec.control_plane_endpoint.port, 6443);
}

#[tokio::test]
async fn test_teardown_in_dependency_order() {
    let h = Harness::new();
    h.provision().await;

    h.store.mark_deleted::<ScalewayManagedCluster>(NAMESPACE, CLUSTER);
    h.store.mark_deleted::<ScalewayManagedControlPlane>(NAMESPACE, "cp1");
    assert_eq!(h.reconcile_managed().await, Action::requeue(Duration::from_secs(10)));
    assert_eq!(h.reconcile_control_plane().await, Action::requeue(Duration::from_secs(10)));

    h.store.mark_deleted::<ScalewayManagedMachinePool>(NAMESPACE, "p1");
    for _ in 0..5 {
        if h.store.get::<ScalewayManagedMachinePool>(NAMESPACE, "p1").is_none() {
            break;
        }
        h.reconcile_pool().await;
    }
    assert!(h.store.get::<ScalewayManagedMachinePool>(NAMESPACE, "p1").is_none());

    for _ in 0..5 {
        if h.store.get::<ScalewayManagedControlPlane>(NAMESPACE, "cp1").is_none() {
            break;
        }
        h.reconcile_control_plane().await;
    }
    assert!(h.store.get::<ScalewayManagedControlPlane>(NAMESPACE, "cp1").is_none());
    assert!(h.kubeconfigs.get(NAMESPACE, CLUSTER).is_none());
    let region = fixtures::region();
    assert!(h.cloud.list_clusters(&region, &[]).await.unwrap().is_empty());

    assert_eq!(h.reconcile_managed().await, Action::await_change());
    assert!(h.store.get::<ScalewayManagedCluster>(NAMESPACE, CLUSTER).is_none());
    assert!(h.cloud.list_private_networks(&region, &[]).await.unwrap().is_empty());
}
