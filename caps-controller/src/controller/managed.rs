//! Controllers of the managed Kubernetes objects.
//!
//! Dependency chain: managed cluster network → control plane → pools.
//! Each object waits for the one before it on the normal path, and is
//! deleted only once the ones after it are gone.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{
    Action, Context, Gate, StatusSink, after_close, bounded, cluster_name_of, persist, settle,
    waiting,
};
use crate::api::{
    Object, ScalewayManagedCluster, ScalewayManagedControlPlane, ScalewayManagedMachinePool,
};
use crate::reconciler::{
    Orchestrator, managed_cluster_orchestrator, managed_control_plane_orchestrator,
    managed_machine_pool_orchestrator,
};
use crate::scope::{ManagedClusterScope, ManagedControlPlaneScope, ManagedMachinePoolScope};

pub struct ManagedClusterController {
    ctx: Arc<Context>,
    sink: Arc<dyn StatusSink<ScalewayManagedCluster>>,
    orchestrator: Orchestrator<ManagedClusterScope>,
}

impl ManagedClusterController {
    pub fn new(ctx: Arc<Context>, sink: Arc<dyn StatusSink<ScalewayManagedCluster>>) -> Self {
        Self::with_orchestrator(ctx, sink, managed_cluster_orchestrator())
    }

    pub fn with_orchestrator(
        ctx: Arc<Context>,
        sink: Arc<dyn StatusSink<ScalewayManagedCluster>>,
        orchestrator: Orchestrator<ManagedClusterScope>,
    ) -> Self {
        Self {
            ctx,
            sink,
            orchestrator,
        }
    }

    #[instrument(skip_all, fields(namespace = %cluster.meta.namespace, name = %cluster.meta.name))]
    pub async fn reconcile(
        &self,
        mut cluster: ScalewayManagedCluster,
        token: &CancellationToken,
    ) -> Result<Action> {
        let deleting = cluster.meta.is_deleting();
        if deleting && !cluster.meta.has_finalizer(ScalewayManagedCluster::FINALIZER) {
            return Ok(Action::await_change());
        }

        let namespace = cluster.meta.namespace.clone();
        let cluster_name = cluster_name_of(&cluster);
        let control_plane = self
            .ctx
            .readiness
            .managed_control_plane(&namespace, &cluster_name)
            .await?;

        if deleting && control_plane.is_some() {
            let action = waiting(
                &mut cluster,
                self.ctx.config.dependents_wait(),
                "waiting for the managed control plane to be deleted",
            );
            persist(self.sink.as_ref(), &cluster).await?;
            return Ok(action);
        }
        if !deleting {
            cluster.meta.add_finalizer(ScalewayManagedCluster::FINALIZER);
        }

        let spec = &cluster.spec;
        let client = self
            .ctx
            .client(&namespace, &spec.scaleway_secret_name, &spec.project_id, &spec.region)
            .await?;
        let mut scope =
            ManagedClusterScope::new(cluster, client, self.sink.clone(), self.ctx.config.clone());
        let deadline = self.ctx.config.reconcile_timeout();

        let result = if deleting {
            scope.set_ready(false);
            match bounded(token, deadline, self.orchestrator.delete(&mut scope)).await {
                Ok(()) => {
                    info!("Managed cluster network deleted");
                    scope
                        .managed_cluster_mut()
                        .meta
                        .remove_finalizer(ScalewayManagedCluster::FINALIZER);
                    Ok(Action::await_change())
                }
                Err(e) => settle(scope.managed_cluster_mut(), Err(e), Action::await_change()),
            }
        } else {
            let result = bounded(token, deadline, self.orchestrator.reconcile(&mut scope)).await;
            if result.is_ok() {
                if let Some(endpoint) = control_plane
                    .map(|cp| cp.spec.control_plane_endpoint)
                    .filter(|e| e.is_set())
                {
                    scope.set_control_plane_endpoint(endpoint);
                }
                scope.set_ready(true);
            }
            settle(scope.managed_cluster_mut(), result, self.ctx.converged())
        };
        let closed = scope.close().await;
        after_close(result, closed)
    }
}

pub struct ManagedControlPlaneController {
    ctx: Arc<Context>,
    sink: Arc<dyn StatusSink<ScalewayManagedControlPlane>>,
    orchestrator: Orchestrator<ManagedControlPlaneScope>,
}

impl ManagedControlPlaneController {
    pub fn new(ctx: Arc<Context>, sink: Arc<dyn StatusSink<ScalewayManagedControlPlane>>) -> Self {
        Self::with_orchestrator(ctx, sink, managed_control_plane_orchestrator())
    }

    pub fn with_orchestrator(
        ctx: Arc<Context>,
        sink: Arc<dyn StatusSink<ScalewayManagedControlPlane>>,
        orchestrator: Orchestrator<ManagedControlPlaneScope>,
    ) -> Self {
        Self {
            ctx,
            sink,
            orchestrator,
        }
    }

    async fn gate(
        &self,
        control_plane: &mut ScalewayManagedControlPlane,
        deleting: bool,
    ) -> Result<Gate<ScalewayManagedCluster>> {
        let readiness = &self.ctx.readiness;
        let namespace = control_plane.meta.namespace.clone();
        let cluster_name = cluster_name_of(control_plane);

        if deleting {
            let pools = readiness.machine_pool_count(&namespace, &cluster_name).await?;
            if pools > 0 {
                let message = format!("waiting for {} machine pools to be deleted", pools);
                let delay = self.ctx.config.dependents_wait();
                return Ok(Gate::Wait(waiting(control_plane, delay, &message)));
            }
        }

        let delay = self.ctx.config.dependency_wait();
        match readiness.managed_cluster(&namespace, &cluster_name).await? {
            Some(managed) if deleting || managed.status.ready => Ok(Gate::Open(managed)),
            Some(_) => Ok(Gate::Wait(waiting(
                control_plane,
                delay,
                "waiting for the managed cluster network to be ready",
            ))),
            None if deleting => {
                warn!(cluster = %cluster_name, "Managed cluster is gone, releasing control plane");
                control_plane
                    .meta
                    .remove_finalizer(ScalewayManagedControlPlane::FINALIZER);
                Ok(Gate::Wait(Action::await_change()))
            }
            None => Ok(Gate::Wait(waiting(
                control_plane,
                delay,
                "waiting for the ScalewayManagedCluster",
            ))),
        }
    }

    #[instrument(
        skip_all,
        fields(namespace = %control_plane.meta.namespace, name = %control_plane.meta.name)
    )]
    pub async fn reconcile(
        &self,
        mut control_plane: ScalewayManagedControlPlane,
        token: &CancellationToken,
    ) -> Result<Action> {
        let deleting = control_plane.meta.is_deleting();
        if deleting && !control_plane.meta.has_finalizer(ScalewayManagedControlPlane::FINALIZER) {
            return Ok(Action::await_change());
        }
        if !deleting {
            control_plane
                .meta
                .add_finalizer(ScalewayManagedControlPlane::FINALIZER);
        }

        let managed = match self.gate(&mut control_plane, deleting).await? {
            Gate::Open(managed) => managed,
            Gate::Wait(action) => {
                persist(self.sink.as_ref(), &control_plane).await?;
                return Ok(action);
            }
        };

        let spec = &managed.spec;
        let client = self
            .ctx
            .client(
                &managed.meta.namespace,
                &spec.scaleway_secret_name,
                &spec.project_id,
                &spec.region,
            )
            .await?;
        let mut scope = ManagedControlPlaneScope::new(
            control_plane,
            managed,
            client,
            self.sink.clone(),
            self.ctx.kubeconfigs.clone(),
            self.ctx.config.clone(),
        );
        let deadline = self.ctx.config.reconcile_timeout();

        let result = if deleting {
            scope.set_ready(false);
            match bounded(token, deadline, self.orchestrator.delete(&mut scope)).await {
                Ok(()) => {
                    info!("Managed control plane deleted");
                    scope
                        .control_plane_mut()
                        .meta
                        .remove_finalizer(ScalewayManagedControlPlane::FINALIZER);
                    Ok(Action::await_change())
                }
                Err(e) => settle(scope.control_plane_mut(), Err(e), Action::await_change()),
            }
        } else {
            let result = bounded(token, deadline, self.orchestrator.reconcile(&mut scope)).await;
            if result.is_ok() {
                scope.set_ready(true);
            }
            settle(scope.control_plane_mut(), result, self.ctx.converged())
        };
        let closed = scope.close().await;
        after_close(result, closed)
    }
}

pub struct ManagedMachinePoolController {
    ctx: Arc<Context>,
    sink: Arc<dyn StatusSink<ScalewayManagedMachinePool>>,
    orchestrator: Orchestrator<ManagedMachinePoolScope>,
}

impl ManagedMachinePoolController {
    pub fn new(ctx: Arc<Context>, sink: Arc<dyn StatusSink<ScalewayManagedMachinePool>>) -> Self {
        Self::with_orchestrator(ctx, sink, managed_machine_pool_orchestrator())
    }

    pub fn with_orchestrator(
        ctx: Arc<Context>,
        sink: Arc<dyn StatusSink<ScalewayManagedMachinePool>>,
        orchestrator: Orchestrator<ManagedMachinePoolScope>,
    ) -> Self {
        Self {
            ctx,
            sink,
            orchestrator,
        }
    }

    async fn gate(
        &self,
        pool: &mut ScalewayManagedMachinePool,
        deleting: bool,
    ) -> Result<Gate<(ScalewayManagedControlPlane, ScalewayManagedCluster)>> {
        let readiness = &self.ctx.readiness;
        let namespace = pool.meta.namespace.clone();
        let cluster_name = cluster_name_of(pool);
        let delay = self.ctx.config.dependency_wait();

        let control_plane = readiness
            .managed_control_plane(&namespace, &cluster_name)
            .await?;
        let managed = readiness.managed_cluster(&namespace, &cluster_name).await?;
        match (control_plane, managed) {
            (Some(cp), Some(managed)) if deleting || cp.status.ready => {
                Ok(Gate::Open((cp, managed)))
            }
            (Some(_), Some(_)) => Ok(Gate::Wait(waiting(
                pool,
                delay,
                "waiting for the managed control plane to be ready",
            ))),
            _ if deleting => {
                warn!(cluster = %cluster_name, "Managed cluster is gone, releasing pool");
                pool.meta
                    .remove_finalizer(ScalewayManagedMachinePool::FINALIZER);
                Ok(Gate::Wait(Action::await_change()))
            }
            _ => Ok(Gate::Wait(waiting(
                pool,
                delay,
                "waiting for the managed control plane",
            ))),
        }
    }

    #[instrument(skip_all, fields(namespace = %pool.meta.namespace, name = %pool.meta.name))]
    pub async fn reconcile(
        &self,
        mut pool: ScalewayManagedMachinePool,
        token: &CancellationToken,
    ) -> Result<Action> {
        let deleting = pool.meta.is_deleting();
        if deleting && !pool.meta.has_finalizer(ScalewayManagedMachinePool::FINALIZER) {
            return Ok(Action::await_change());
        }
        if !deleting {
            pool.meta.add_finalizer(ScalewayManagedMachinePool::FINALIZER);
        }

        let (control_plane, managed) = match self.gate(&mut pool, deleting).await? {
            Gate::Open(owners) => owners,
            Gate::Wait(action) => {
                persist(self.sink.as_ref(), &pool).await?;
                return Ok(action);
            }
        };

        let spec = &managed.spec;
        let client = self
            .ctx
            .client(
                &managed.meta.namespace,
                &spec.scaleway_secret_name,
                &spec.project_id,
                &spec.region,
            )
            .await?;
        let mut scope = ManagedMachinePoolScope::new(
            pool,
            control_plane,
            managed,
            client,
            self.sink.clone(),
            self.ctx.config.clone(),
        );
        let deadline = self.ctx.config.reconcile_timeout();

        let result = if deleting {
            scope.set_ready(false);
            match bounded(token, deadline, self.orchestrator.delete(&mut scope)).await {
                Ok(()) => {
                    info!("Pool deleted");
                    scope
                        .pool_mut()
                        .meta
                        .remove_finalizer(ScalewayManagedMachinePool::FINALIZER);
                    Ok(Action::await_change())
                }
                Err(e) => settle(scope.pool_mut(), Err(e), Action::await_change()),
            }
        } else {
            let result = bounded(token, deadline, self.orchestrator.reconcile(&mut scope)).await;
            if result.is_ok() {
                scope.set_ready(true);
            }
            settle(scope.pool_mut(), result, self.ctx.converged())
        };
        let closed = scope.close().await;
        after_close(result, closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MockKubeconfigSink, MockReadinessSource};
    use crate::reconciler::Reconciler;
    use crate::test_util::{InMemoryCloud, RecordingSink, fixtures};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts calls without touching the provider.
    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reconciler<ManagedMachinePoolScope> for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, _scope: &mut ManagedMachinePoolScope) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _scope: &mut ManagedMachinePoolScope) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(readiness: MockReadinessSource) -> Arc<Context> {
        let cloud = InMemoryCloud::new();
        Arc::new(Context::new(
            cloud,
            Arc::new(readiness),
            Arc::new(MockKubeconfigSink::new()),
            Default::default(),
        ))
    }

    #[tokio::test]
    async fn test_pool_waits_for_control_plane() {
        let mut readiness = MockReadinessSource::new();
        let mut control_plane = fixtures::control_plane("cp1", "1.30.2");
        control_plane.status.ready = false;
        readiness
            .expect_managed_control_plane()
            .returning(move |_, _| Ok(Some(control_plane.clone())));
        readiness
            .expect_managed_cluster()
            .returning(|_, _| Ok(Some(fixtures::managed_cluster("mc1"))));

        let calls = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink::<ScalewayManagedMachinePool>::new();
        let controller = ManagedMachinePoolController::with_orchestrator(
            context(readiness),
            sink.clone(),
            Orchestrator::new().with(Counting(calls.clone())),
        );

        let action = controller
            .reconcile(fixtures::pool("p1", "DEV1-M", 1), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let persisted = sink.last().unwrap();
        assert!(persisted.meta.has_finalizer(ScalewayManagedMachinePool::FINALIZER));
        assert!(persisted.status.failure.is_none());
    }

    #[tokio::test]
    async fn test_control_plane_delete_waits_for_pools() {
        let mut readiness = MockReadinessSource::new();
        readiness.expect_machine_pool_count().returning(|_, _| Ok(2));
        readiness.expect_managed_cluster().never();

        let sink = RecordingSink::<ScalewayManagedControlPlane>::new();
        let controller = ManagedControlPlaneController::new(context(readiness), sink.clone());
        let mut control_plane = fixtures::control_plane("cp1", "1.30.2");
        control_plane
            .meta
            .add_finalizer(ScalewayManagedControlPlane::FINALIZER);
        control_plane.meta.deletion_timestamp = Some(chrono::Utc::now());

        let action = controller
            .reconcile(control_plane, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        let persisted = sink.last().unwrap();
        assert!(persisted.meta.has_finalizer(ScalewayManagedControlPlane::FINALIZER));
    }

    #[tokio::test]
    async fn test_deleted_object_without_finalizer_is_ignored() {
        let readiness = MockReadinessSource::new();
        let sink = RecordingSink::<ScalewayManagedCluster>::new();
        let controller = ManagedClusterController::new(context(readiness), sink.clone());
        let mut cluster = fixtures::managed_cluster("mc1");
        cluster.meta.deletion_timestamp = Some(chrono::Utc::now());

        let action = controller
            .reconcile(cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(sink.last().is_none());
    }
}
