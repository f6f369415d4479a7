//! Self-managed cluster lifecycle against the in-memory cloud.

mod common;

use std::time::Duration;

use caps_controller::Action;
use caps_controller::api::{
    Object, READY_CONDITION, ScalewayCluster, ScalewayMachine, find_condition,
};
use caps_controller::clients::{InstanceApi, LoadBalancerApi, VpcApi};
use caps_controller::test_util::fixtures::{self, NAMESPACE};
use tokio_test::assert_ok;

use common::{Harness, is_requeue};

impl Harness {
    async fn reconcile_cluster(&self) -> Action {
        let cluster = self.store.get::<ScalewayCluster>(NAMESPACE, "c1").expect("cluster exists");
        assert_ok!(self.clusters.reconcile(cluster, &self.token).await)
    }

    async fn reconcile_machine(&self, name: &str) -> Action {
        let machine = self.store.get::<ScalewayMachine>(NAMESPACE, name).expect("machine exists");
        assert_ok!(self.machines.reconcile(machine, &self.token).await)
    }

    /// Reconcile the machine until the controller stops requeueing.
    async fn converge_machine(&self, name: &str) {
        for _ in 0..5 {
            if !is_requeue(&self.reconcile_machine(name).await) {
                return;
            }
        }
        panic!("machine {} did not converge", name);
    }

    async fn ready_cluster(&self) -> ScalewayCluster {
        self.store.insert(&fixtures::cluster("c1"));
        assert_eq!(self.reconcile_cluster().await, Action::await_change());
        self.store.get(NAMESPACE, "c1").expect("cluster exists")
    }
}

#[tokio::test]
async fn test_cluster_becomes_ready() {
    let h = Harness::new();

    let cluster = h.ready_cluster().await;

    assert!(cluster.status.ready);
    assert!(cluster.meta.has_finalizer(ScalewayCluster::FINALIZER));
    assert_eq!(cluster.status.failure_domains, vec!["fr-par-1", "fr-par-2", "fr-par-3"]);
    let network = cluster.status.network.as_ref().unwrap();
    assert!(network.private_network_id.is_some());
    assert!(network.load_balancer_ip.is_some());
    assert!(cluster.spec.control_plane_endpoint.is_set());
    let ready = find_condition(&cluster.status.conditions, READY_CONDITION).unwrap();
    assert_eq!(ready.reason, "Reconciled");

    let calls = h.cloud.mutating_calls();
    assert_eq!(h.reconcile_cluster().await, Action::await_change());
    assert_eq!(h.cloud.mutating_calls(), calls);
}

#[tokio::test]
async fn test_machine_waits_for_owner() {
    let h = Harness::new();
    h.ready_cluster().await;
    h.store.insert(&fixtures::machine("m1"));

    let action = h.reconcile_machine("m1").await;

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    let machine: ScalewayMachine = h.store.get(NAMESPACE, "m1").unwrap();
    assert!(machine.meta.has_finalizer(ScalewayMachine::FINALIZER));
    assert!(machine.spec.provider_id.is_none());
    assert_eq!(h.cloud.list_servers(&fixtures::zone(), &[]).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new();
    h.ready_cluster().await;
    h.store.insert(&fixtures::machine("m1"));
    h.add_owner_machine("m1", "c1", true);

    h.converge_machine("m1").await;
    let machine: ScalewayMachine = h.store.get(NAMESPACE, "m1").unwrap();
    assert!(machine.status.ready);
    assert!(machine.spec.provider_id.is_some());

    h.store.mark_deleted::<ScalewayCluster>(NAMESPACE, "c1");
    assert_eq!(h.reconcile_cluster().await, Action::requeue(Duration::from_secs(10)));
    assert!(h.store.get::<ScalewayCluster>(NAMESPACE, "c1").is_some());

    h.store.mark_deleted::<ScalewayMachine>(NAMESPACE, "m1");
    for _ in 0..5 {
        if h.store.get::<ScalewayMachine>(NAMESPACE, "m1").is_none() {
            break;
        }
        h.reconcile_machine("m1").await;
    }
    assert!(h.store.get::<ScalewayMachine>(NAMESPACE, "m1").is_none());
    assert!(h.cloud.list_servers(&fixtures::zone(), &[]).await.unwrap().is_empty());

    assert_eq!(h.reconcile_cluster().await, Action::await_change());
    assert!(h.store.get::<ScalewayCluster>(NAMESPACE, "c1").is_none());
    let region = fixtures::region();
    assert!(h.cloud.list_private_networks(&region, &[]).await.unwrap().is_empty());
    assert!(h.cloud.list_load_balancers(&region, &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_with_network_in_use_requeues() {
    let h = Harness::new();
    let cluster = h.ready_cluster().await;
    let pn_id = cluster.status.network.unwrap().private_network_id.unwrap();
    h.cloud.set_private_network_in_use(&pn_id, true);

    h.store.mark_deleted::<ScalewayCluster>(NAMESPACE, "c1");
    let action = h.reconcile_cluster().await;

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    let cluster: ScalewayCluster = h.store.get(NAMESPACE, "c1").unwrap();
    assert!(cluster.meta.has_finalizer(ScalewayCluster::FINALIZER));
    assert!(cluster.status.failure.is_none());
    assert!(!cluster.status.ready);

    h.cloud.set_private_network_in_use(&pn_id, false);
    assert_eq!(h.reconcile_cluster().await, Action::await_change());
    assert!(h.store.get::<ScalewayCluster>(NAMESPACE, "c1").is_none());
}

#[tokio::test]
async fn test_invalid_network_records_failure() {
    let h = Harness::new();
    let pn = h.cloud.seed_private_network("user-pn", false, &[]);
    let mut cluster = fixtures::cluster("c1");
    cluster.spec.network.private_network.id = Some(pn.id);
    h.store.insert(&cluster);

    assert_eq!(h.reconcile_cluster().await, Action::await_change());

    let cluster: ScalewayCluster = h.store.get(NAMESPACE, "c1").unwrap();
    assert!(!cluster.status.ready);
    let failure = cluster.status.failure.unwrap();
    assert!(failure.message.contains("DHCP"));
}
