//! ScalewayMachine controller.
//!
//! A machine only provisions once its owning Machine is set, the cluster
//! infrastructure is ready and the bootstrap data exists.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{
    Action, Context, Gate, StatusSink, after_close, bounded, cluster_name_of, persist, settle,
    waiting,
};
use crate::api::{Object, OwnerMachine, ScalewayCluster, ScalewayMachine};
use crate::reconciler::{Orchestrator, machine_orchestrator};
use crate::scope::MachineScope;

pub struct MachineController {
    ctx: Arc<Context>,
    sink: Arc<dyn StatusSink<ScalewayMachine>>,
    orchestrator: Orchestrator<MachineScope>,
}

/// Inputs a machine reconciliation needs besides the machine itself.
struct Owners {
    machine: OwnerMachine,
    cluster: ScalewayCluster,
    bootstrap_data: Option<Vec<u8>>,
}

impl MachineController {
    pub fn new(ctx: Arc<Context>, sink: Arc<dyn StatusSink<ScalewayMachine>>) -> Self {
        Self::with_orchestrator(ctx, sink, machine_orchestrator())
    }

    pub fn with_orchestrator(
        ctx: Arc<Context>,
        sink: Arc<dyn StatusSink<ScalewayMachine>>,
        orchestrator: Orchestrator<MachineScope>,
    ) -> Self {
        Self {
            ctx,
            sink,
            orchestrator,
        }
    }

    #[instrument(skip_all, fields(namespace = %machine.meta.namespace, name = %machine.meta.name))]
    pub async fn reconcile(
        &self,
        mut machine: ScalewayMachine,
        token: &CancellationToken,
    ) -> Result<Action> {
        let deleting = machine.meta.is_deleting();
        if deleting && !machine.meta.has_finalizer(ScalewayMachine::FINALIZER) {
            return Ok(Action::await_change());
        }
        if !deleting {
            machine.meta.add_finalizer(ScalewayMachine::FINALIZER);
        }

        let owners = if deleting {
            match self.delete_owners(&machine).await? {
                Some(owners) => owners,
                None => {
                    machine.meta.remove_finalizer(ScalewayMachine::FINALIZER);
                    persist(self.sink.as_ref(), &machine).await?;
                    return Ok(Action::await_change());
                }
            }
        } else {
            match self.gate(&mut machine).await? {
                Gate::Open(owners) => owners,
                Gate::Wait(action) => {
                    persist(self.sink.as_ref(), &machine).await?;
                    return Ok(action);
                }
            }
        };

        let spec = &owners.cluster.spec;
        let client = self
            .ctx
            .client(
                &owners.cluster.meta.namespace,
                &spec.scaleway_secret_name,
                &spec.project_id,
                &spec.region,
            )
            .await?;
        let mut scope = MachineScope::new(
            machine,
            owners.machine,
            owners.cluster,
            owners.bootstrap_data,
            client,
            self.sink.clone(),
            self.ctx.config.clone(),
        );

        let result = if deleting {
            self.reconcile_delete(&mut scope, token).await
        } else {
            self.reconcile_normal(&mut scope, token).await
        };
        let closed = scope.close().await;
        after_close(result, closed)
    }

    /// Readiness gates of the normal path.
    async fn gate(&self, machine: &mut ScalewayMachine) -> Result<Gate<Owners>> {
        let readiness = &self.ctx.readiness;
        let delay = self.ctx.config.dependency_wait();
        let namespace = machine.meta.namespace.clone();

        let Some(owner) = readiness.owner_machine(&namespace, &machine.meta.name).await? else {
            return Ok(Gate::Wait(waiting(machine, delay, "waiting for the owning Machine")));
        };
        let Some(cluster) = readiness.cluster(&namespace, &owner.cluster_name).await? else {
            return Ok(Gate::Wait(waiting(machine, delay, "waiting for the ScalewayCluster")));
        };
        if !cluster.status.ready {
            return Ok(Gate::Wait(waiting(
                machine,
                delay,
                "waiting for the cluster infrastructure to be ready",
            )));
        }
        let Some(secret) = owner.bootstrap_data_secret.as_deref() else {
            return Ok(Gate::Wait(waiting(machine, delay, "waiting for bootstrap data")));
        };
        let Some(bootstrap_data) = readiness.bootstrap_data(&namespace, secret).await? else {
            return Ok(Gate::Wait(waiting(machine, delay, "waiting for bootstrap data")));
        };

        Ok(Gate::Open(Owners {
            machine: owner,
            cluster,
            bootstrap_data: Some(bootstrap_data),
        }))
    }

    /// Owners needed to tear a machine down. `None` when the cluster is
    /// gone, which leaves nothing to delete from.
    async fn delete_owners(&self, machine: &ScalewayMachine) -> Result<Option<Owners>> {
        let readiness = &self.ctx.readiness;
        let namespace = &machine.meta.namespace;
        let owner = match readiness.owner_machine(namespace, &machine.meta.name).await? {
            Some(owner) => owner,
            None => OwnerMachine {
                name: machine.meta.name.clone(),
                cluster_name: cluster_name_of(machine),
                ..Default::default()
            },
        };
        let Some(cluster) = readiness.cluster(namespace, &owner.cluster_name).await? else {
            warn!(cluster = %owner.cluster_name, "Cluster is gone, releasing machine");
            return Ok(None);
        };
        Ok(Some(Owners {
            machine: owner,
            cluster,
            bootstrap_data: None,
        }))
    }

    async fn reconcile_normal(
        &self,
        scope: &mut MachineScope,
        token: &CancellationToken,
    ) -> Result<Action> {
        let config = self.ctx.config.clone();
        let result = bounded(
            token,
            config.reconcile_timeout(),
            self.orchestrator.reconcile(scope),
        )
        .await;
        if result.is_ok() {
            scope.set_ready(true);
        }
        settle(scope.scaleway_machine_mut(), result, self.ctx.converged())
    }

    async fn reconcile_delete(
        &self,
        scope: &mut MachineScope,
        token: &CancellationToken,
    ) -> Result<Action> {
        let config = self.ctx.config.clone();
        scope.set_ready(false);
        let result = bounded(token, config.reconcile_timeout(), self.orchestrator.delete(scope))
            .await;
        if result.is_ok() {
            info!("Machine resources deleted");
            scope
                .scaleway_machine_mut()
                .meta
                .remove_finalizer(ScalewayMachine::FINALIZER);
            return Ok(Action::await_change());
        }
        settle(scope.scaleway_machine_mut(), result, Action::await_change())
    }
}
