//! Provider error types.

use thiserror::Error;

/// Errors returned by the cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// The resource is still used by another resource and cannot be changed yet.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The project reached a provider quota; raising it needs an operator.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl CloudError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Find the provider error in the chain of `err`.
pub fn cloud_error(err: &anyhow::Error) -> Option<&CloudError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CloudError>())
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(cloud_error(err), Some(CloudError::NotFound { .. }))
}

pub fn is_precondition_failed(err: &anyhow::Error) -> bool {
    matches!(cloud_error(err), Some(CloudError::PreconditionFailed(_)))
}

pub fn is_quota_exceeded(err: &anyhow::Error) -> bool {
    matches!(cloud_error(err), Some(CloudError::QuotaExceeded(_)))
}
