//! ScalewayCluster controller.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{Action, Context, StatusSink, after_close, bounded, cluster_name_of, settle, waiting};
use crate::api::{Object, ScalewayCluster};
use crate::reconciler::{Orchestrator, cluster_orchestrator};
use crate::scope::ClusterScope;

pub struct ClusterController {
    ctx: Arc<Context>,
    sink: Arc<dyn StatusSink<ScalewayCluster>>,
    orchestrator: Orchestrator<ClusterScope>,
}

impl ClusterController {
    pub fn new(ctx: Arc<Context>, sink: Arc<dyn StatusSink<ScalewayCluster>>) -> Self {
        Self::with_orchestrator(ctx, sink, cluster_orchestrator())
    }

    pub fn with_orchestrator(
        ctx: Arc<Context>,
        sink: Arc<dyn StatusSink<ScalewayCluster>>,
        orchestrator: Orchestrator<ClusterScope>,
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
        cluster: ScalewayCluster,
        token: &CancellationToken,
    ) -> Result<Action> {
        if cluster.meta.is_deleting() && !cluster.meta.has_finalizer(ScalewayCluster::FINALIZER) {
            return Ok(Action::await_change());
        }

        let spec = &cluster.spec;
        let client = self
            .ctx
            .client(
                &cluster.meta.namespace,
                &spec.scaleway_secret_name,
                &spec.project_id,
                &spec.region,
            )
            .await?;
        let mut scope =
            ClusterScope::new(cluster, client, self.sink.clone(), self.ctx.config.clone());

        let result = if scope.cluster().meta.is_deleting() {
            self.reconcile_delete(&mut scope, token).await
        } else {
            self.reconcile_normal(&mut scope, token).await
        };
        let closed = scope.close().await;
        after_close(result, closed)
    }

    async fn reconcile_normal(
        &self,
        scope: &mut ClusterScope,
        token: &CancellationToken,
    ) -> Result<Action> {
        scope
            .cluster_mut()
            .meta
            .add_finalizer(ScalewayCluster::FINALIZER);

        let config = self.ctx.config.clone();
        let result = bounded(
            token,
            config.reconcile_timeout(),
            self.orchestrator.reconcile(scope),
        )
        .await;
        if result.is_ok() {
            let domains = match &scope.cluster().spec.failure_domains {
                domains if !domains.is_empty() => domains.clone(),
                _ => scope
                    .cluster()
                    .spec
                    .region
                    .zones()
                    .iter()
                    .map(|z| z.to_string())
                    .collect(),
            };
            scope.set_failure_domains(domains);
            scope.set_ready(true);
        }
        settle(scope.cluster_mut(), result, self.ctx.converged())
    }

    async fn reconcile_delete(
        &self,
        scope: &mut ClusterScope,
        token: &CancellationToken,
    ) -> Result<Action> {
        let config = self.ctx.config.clone();
        let namespace = scope.cluster().meta.namespace.clone();
        let cluster_name = cluster_name_of(scope.cluster());

        let machines = self
            .ctx
            .readiness
            .machine_count(&namespace, &cluster_name)
            .await?;
        if machines > 0 {
            let message = format!("waiting for {} machines to be deleted", machines);
            return Ok(waiting(scope.cluster_mut(), config.dependents_wait(), &message));
        }

        scope.set_ready(false);
        let result = bounded(token, config.reconcile_timeout(), self.orchestrator.delete(scope))
            .await;
        if result.is_ok() {
            info!("Cluster resources deleted");
            scope
                .cluster_mut()
                .meta
                .remove_finalizer(ScalewayCluster::FINALIZER);
            return Ok(Action::await_change());
        }
        settle(scope.cluster_mut(), result, Action::await_change())
    }
}
