//! Per-kind reconciliation state machines.
//!
//! Each controller handles one object per call: it decides between the
//! normal and the deleting path, evaluates readiness gates, runs the kind's
//! [`Orchestrator`](crate::reconciler::Orchestrator) and translates the
//! classified result into an [`Action`] for the scheduler.
//!
//! | Outcome       | Result                                  |
//! |---------------|-----------------------------------------|
//! | success       | `Ok(await_change)` or resync requeue    |
//! | Transient(d)  | `Ok(requeue(d))`                        |
//! | Terminal(msg) | failure recorded, `Ok(await_change)`    |
//! | Unclassified  | `Err(e)`                                |

pub mod cluster;
pub mod machine;
pub mod managed;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{
    ConditionStatus, Failure, Object, OwnerMachine, READY_CONDITION, ScalewayCluster,
    ScalewayManagedCluster, ScalewayManagedControlPlane, set_condition,
};
use crate::clients::{CloudClient, CloudClientFactory, Credentials, Region};
use crate::config::ControllerConfig;
use crate::error::{Outcome, classify};

pub use cluster::ClusterController;
pub use machine::MachineController;
pub use managed::{
    ManagedClusterController, ManagedControlPlaneController, ManagedMachinePoolController,
};

/// What the scheduler should do after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Reconcile again only when the object changes.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Errors of the controller boundary itself.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("reconciliation did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

/// Persists an object's status, finalizers and endpoint.
#[async_trait]
pub trait StatusSink<T: Send + Sync>: Send + Sync {
    async fn persist(&self, object: &T) -> Result<()>;
}

/// Status of collaborating objects, read for readiness gates.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadinessSource: Send + Sync {
    /// The generic Machine owning a ScalewayMachine, once the owner is set.
    async fn owner_machine(&self, namespace: &str, name: &str) -> Result<Option<OwnerMachine>>;

    async fn cluster(&self, namespace: &str, cluster_name: &str)
    -> Result<Option<ScalewayCluster>>;

    /// ScalewayMachines still belonging to a cluster.
    async fn machine_count(&self, namespace: &str, cluster_name: &str) -> Result<usize>;

    async fn bootstrap_data(&self, namespace: &str, secret_name: &str)
    -> Result<Option<Vec<u8>>>;

    async fn managed_cluster(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ScalewayManagedCluster>>;

    async fn managed_control_plane(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<ScalewayManagedControlPlane>>;

    /// Managed machine pools still belonging to a cluster.
    async fn machine_pool_count(&self, namespace: &str, cluster_name: &str) -> Result<usize>;
}

/// Stores the admin kubeconfig of managed clusters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeconfigSink: Send + Sync {
    async fn store(&self, namespace: &str, cluster_name: &str, kubeconfig: &[u8]) -> Result<()>;

    async fn delete(&self, namespace: &str, cluster_name: &str) -> Result<()>;
}

/// Collaborators shared by every controller.
pub struct Context {
    pub clients: Arc<dyn CloudClientFactory>,
    pub readiness: Arc<dyn ReadinessSource>,
    pub kubeconfigs: Arc<dyn KubeconfigSink>,
    pub config: Arc<ControllerConfig>,
}

impl Context {
    pub fn new(
        clients: Arc<dyn CloudClientFactory>,
        readiness: Arc<dyn ReadinessSource>,
        kubeconfigs: Arc<dyn KubeconfigSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            clients,
            readiness,
            kubeconfigs,
            config: Arc::new(config),
        }
    }

    /// Authenticated client for an object's credentials.
    pub(crate) async fn client(
        &self,
        namespace: &str,
        secret_name: &str,
        project_id: &str,
        region: &Region,
    ) -> Result<Arc<dyn CloudClient>> {
        let credentials = Credentials {
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            project_id: project_id.to_string(),
            region: region.clone(),
        };
        self.clients
            .client(&credentials)
            .await
            .with_context(|| {
                format!(
                    "failed to create client from secret {}/{}",
                    namespace, secret_name
                )
            })
    }

    /// Action after a successful pass.
    pub(crate) fn converged(&self) -> Action {
        self.config
            .resync()
            .map_or_else(Action::await_change, Action::requeue)
    }
}

/// Run `pass` until it finishes, `token` is cancelled or the deadline passes.
///
/// A cancelled or timed out pass is dropped at its current await point.
pub(crate) async fn bounded<F>(token: &CancellationToken, deadline: Duration, pass: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(ControllerError::Cancelled.into()),
        result = tokio::time::timeout(deadline, pass) => match result {
            Ok(result) => result,
            Err(_) => Err(ControllerError::DeadlineExceeded(deadline).into()),
        },
    }
}

/// Record the result of a pass on `object` and turn it into an [`Action`].
pub(crate) fn settle<T: Object>(
    object: &mut T,
    result: Result<()>,
    success: Action,
) -> Result<Action> {
    let err = match result {
        Ok(()) => {
            set_condition(
                object.conditions_mut(),
                READY_CONDITION,
                ConditionStatus::True,
                "Reconciled",
                "",
            );
            object.set_failure(None);
            return Ok(success);
        }
        Err(err) => err,
    };

    match classify(&err) {
        Outcome::Transient(delay) => {
            debug!(
                kind = T::KIND,
                name = %object.meta().name,
                ?delay,
                error = %format!("{:#}", err),
                "Requeueing"
            );
            set_condition(
                object.conditions_mut(),
                READY_CONDITION,
                ConditionStatus::False,
                "Progressing",
                &format!("{:#}", err),
            );
            Ok(Action::requeue(delay))
        }
        Outcome::Terminal(message) => {
            warn!(
                kind = T::KIND,
                name = %object.meta().name,
                error = %message,
                "Reconciliation failed"
            );
            set_condition(
                object.conditions_mut(),
                READY_CONDITION,
                ConditionStatus::False,
                "Failed",
                &message,
            );
            object.set_failure(Some(Failure {
                reason: "ReconcileFailed".to_string(),
                message,
            }));
            Ok(Action::await_change())
        }
        Outcome::Unclassified => {
            set_condition(
                object.conditions_mut(),
                READY_CONDITION,
                ConditionStatus::False,
                "Error",
                &format!("{:#}", err),
            );
            Err(err)
        }
    }
}

/// Result of a readiness gate.
pub(crate) enum Gate<T> {
    /// Dependencies are ready; carries what the pass needs from them.
    Open(T),
    /// Requeue without running the orchestrator.
    Wait(Action),
}

/// Record that `object` waits on another object and requeue.
pub(crate) fn waiting<T: Object>(object: &mut T, delay: Duration, message: &str) -> Action {
    info!(kind = T::KIND, name = %object.meta().name, ?delay, "{}", message);
    set_condition(
        object.conditions_mut(),
        READY_CONDITION,
        ConditionStatus::False,
        "WaitingForDependency",
        message,
    );
    Action::requeue(delay)
}

/// Persist an object the pass never built a scope for.
pub(crate) async fn persist<T: Object>(sink: &dyn StatusSink<T>, object: &T) -> Result<()> {
    sink.persist(object).await.with_context(|| {
        format!(
            "failed to persist {} {}/{}",
            T::KIND,
            object.meta().namespace,
            object.meta().name
        )
    })
}

/// Keep the pass result unless closing the scope failed on a successful pass.
pub(crate) fn after_close(result: Result<Action>, closed: Result<()>) -> Result<Action> {
    match (result, closed) {
        (Ok(_), Err(e)) => Err(e),
        (result, Err(e)) => {
            warn!(error = %format!("{:#}", e), "Failed to persist status after failed pass");
            result
        }
        (result, Ok(())) => result,
    }
}

/// Name of the cluster an object belongs to: its cluster label, else its own name.
pub(crate) fn cluster_name_of<T: Object>(object: &T) -> String {
    object
        .meta()
        .cluster_name()
        .unwrap_or(&object.meta().name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ScalewayCluster, find_condition};
    use crate::error::ReconcileError;
    use crate::test_util::fixtures;

    #[test]
    fn test_settle_transient_requeues_without_failure() {
        let mut cluster: ScalewayCluster = fixtures::cluster("c1");
        let result = Err(ReconcileError::transient(Duration::from_secs(5), "in use").into());

        let action = settle(&mut cluster, result, Action::await_change()).unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert!(cluster.status.failure.is_none());
        let ready = find_condition(&cluster.status.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "Progressing");
    }

    #[test]
    fn test_settle_terminal_records_failure() {
        let mut cluster: ScalewayCluster = fixtures::cluster("c1");
        let result = Err(anyhow::Error::from(ReconcileError::terminal("must have DHCP enabled"))
            .context("failed to reconcile vpc"));

        let action = settle(&mut cluster, result, Action::await_change()).unwrap();

        assert_eq!(action, Action::await_change());
        let failure = cluster.status.failure.unwrap();
        assert!(failure.message.contains("DHCP"));
    }

    #[test]
    fn test_settle_unclassified_propagates() {
        let mut cluster: ScalewayCluster = fixtures::cluster("c1");

        let result = settle(
            &mut cluster,
            Err(anyhow::anyhow!("connection reset")),
            Action::await_change(),
        );

        assert!(result.is_err());
        assert!(cluster.status.failure.is_none());
    }

    #[test]
    fn test_settle_success_clears_failure() {
        let mut cluster: ScalewayCluster = fixtures::cluster("c1");
        cluster.status.failure = Some(Failure::default());

        let action =
            settle(&mut cluster, Ok(()), Action::requeue(Duration::from_secs(60))).unwrap();

        assert_eq!(action.requeue_after(), Some(Duration::from_secs(60)));
        assert!(cluster.status.failure.is_none());
        let ready = find_condition(&cluster.status.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let err = bounded(&token, Duration::from_secs(1), std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<ControllerError>(), Some(ControllerError::Cancelled)));
        assert_eq!(classify(&err), Outcome::Unclassified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_deadline() {
        let token = CancellationToken::new();

        let err = bounded(&token, Duration::from_secs(300), std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ControllerError>(),
            Some(ControllerError::DeadlineExceeded(_))
        ));
    }
}
