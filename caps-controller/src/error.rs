//! Reconcile error classification.
//!
//! Failures are classified where the cause is recognised (a provider error
//! signature, a lifecycle state the code checked itself) by returning a
//! [`ReconcileError`]. Intermediate layers add context with
//! [`anyhow::Context`]; the controller boundary recovers the classification
//! with [`classify`], which walks the error chain instead of looking at
//! messages.

use std::time::Duration;

use thiserror::Error;

/// Boxed source error carried by a [`ReconcileError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A classified reconciliation failure.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The operation can succeed later without operator intervention.
    #[error("{message} (retry in {requeue_after:?})")]
    Transient {
        message: String,
        requeue_after: Duration,
        #[source]
        source: Option<BoxError>,
    },

    /// The operation cannot succeed as configured.
    #[error("{message}")]
    Terminal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl ReconcileError {
    /// Create a transient error that should be retried after `requeue_after`.
    pub fn transient(requeue_after: Duration, message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            requeue_after,
            source: None,
        }
    }

    /// Create a terminal error. The owning reconciliation stops retrying.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal {
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(self, cause: impl Into<BoxError>) -> Self {
        match self {
            Self::Transient {
                message,
                requeue_after,
                ..
            } => Self::Transient {
                message,
                requeue_after,
                source: Some(cause.into()),
            },
            Self::Terminal { message, .. } => Self::Terminal {
                message,
                source: Some(cause.into()),
            },
        }
    }

    /// Requeue delay for transient errors.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { requeue_after, .. } => Some(*requeue_after),
            Self::Terminal { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    /// Human-readable reason including the underlying cause, for conditions.
    pub fn reason(&self) -> String {
        let (message, source) = match self {
            Self::Transient {
                message, source, ..
            }
            | Self::Terminal { message, source } => (message, source),
        };
        match source {
            Some(cause) => format!("{}: {}", message, cause),
            None => message.clone(),
        }
    }
}

/// Classification recovered at the controller boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Retry after the carried delay; not a reconciliation failure.
    Transient(Duration),
    /// Stop and surface the message to the operator.
    Terminal(String),
    /// Not classified; the scheduler's default backoff applies.
    Unclassified,
}

/// Find the first [`ReconcileError`] in the chain of `err`.
///
/// Works regardless of how many `context` layers were added on top.
pub fn find_reconcile_error(err: &anyhow::Error) -> Option<&ReconcileError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ReconcileError>())
}

/// Recover the classification of `err`.
pub fn classify(err: &anyhow::Error) -> Outcome {
    match find_reconcile_error(err) {
        Some(ReconcileError::Transient { requeue_after, .. }) => Outcome::Transient(*requeue_after),
        Some(terminal @ ReconcileError::Terminal { .. }) => Outcome::Terminal(terminal.reason()),
        None => Outcome::Unclassified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    fn wrap(err: anyhow::Error, times: usize) -> anyhow::Error {
        (0..times).fold(err, |e, i| e.context(format!("layer {}", i)))
    }

    #[test]
    fn test_transient_survives_many_context_layers() {
        let err: anyhow::Error =
            ReconcileError::transient(Duration::from_secs(5), "private network in use").into();
        let wrapped = wrap(err, 7);

        assert_eq!(classify(&wrapped), Outcome::Transient(Duration::from_secs(5)));
    }

    #[test]
    fn test_terminal_reason_includes_cause() {
        let err = ReconcileError::terminal("private network must have DHCP enabled")
            .with_source(anyhow!("pn-123 has dhcp_enabled=false"));
        let wrapped = wrap(err.into(), 3);

        match classify(&wrapped) {
            Outcome::Terminal(reason) => {
                assert!(reason.contains("DHCP enabled"));
                assert!(reason.contains("pn-123"));
            }
            other => panic!("expected terminal, got {:?}", other),
        }
    }

    #[test]
    fn test_unclassified_error() {
        let err = anyhow!("connection reset by peer").context("listing gateways");
        assert_eq!(classify(&err), Outcome::Unclassified);
    }

    #[test]
    fn test_context_on_result() {
        fn failing() -> anyhow::Result<()> {
            Err(ReconcileError::transient(Duration::from_secs(1), "gateway not ready").into())
        }
        let err = failing()
            .context("attaching gateway")
            .context("reconciling vpcgw")
            .unwrap_err();

        assert_eq!(classify(&err), Outcome::Transient(Duration::from_secs(1)));
        assert!(find_reconcile_error(&err).is_some());
    }

    #[test]
    fn test_outermost_classification_wins() {
        let inner: anyhow::Error =
            ReconcileError::transient(Duration::from_secs(1), "inner").into();
        let outer = ReconcileError::terminal("outer").with_source(inner);
        let err = wrap(outer.into(), 2);

        assert!(matches!(classify(&err), Outcome::Terminal(_)));
    }

    #[test]
    fn test_requeue_after() {
        let err = ReconcileError::transient(Duration::from_secs(3), "x");
        assert_eq!(err.requeue_after(), Some(Duration::from_secs(3)));
        assert!(!err.is_terminal());
        assert_eq!(ReconcileError::terminal("y").requeue_after(), None);
    }
}
