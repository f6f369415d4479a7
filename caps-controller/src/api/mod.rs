//! Desired-state objects handed to the controllers.
//!
//! These mirror the Kubernetes-style custom resources the surrounding
//! control plane stores. The controllers only read `spec` and write
//! `status`, finalizers and the control-plane endpoint.

/// Implement [`Object`] for a type with `meta` and `status.{conditions,failure}`.
macro_rules! impl_object {
    ($ty:ty, $kind:literal, $finalizer:literal) => {
        impl $crate::api::Object for $ty {
            const KIND: &'static str = $kind;
            const FINALIZER: &'static str = $finalizer;

            fn meta(&self) -> &$crate::api::ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::api::ObjectMeta {
                &mut self.meta
            }

            fn conditions_mut(&mut self) -> &mut Vec<$crate::api::Condition> {
                &mut self.status.conditions
            }

            fn set_failure(&mut self, failure: Option<$crate::api::Failure>) {
                self.status.failure = failure;
            }
        }
    };
}

pub(crate) use impl_object;

pub mod cluster;
pub mod machine;
pub mod managed;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cluster::*;
pub use machine::*;
pub use managed::*;

/// Label carrying the name of the owning cluster.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Condition type set once the object converged.
pub const READY_CONDITION: &str = "Ready";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub finalizers: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.labels.get(CLUSTER_NAME_LABEL).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Set a condition, keeping the transition time when the status is unchanged.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Utc::now();
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now(),
    });
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Address the cluster API server is reachable at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl ApiEndpoint {
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// Reason and message of a terminal failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub reason: String,
    pub message: String,
}

/// Common accessors of every reconciled object.
pub trait Object: Clone + Send + Sync + 'static {
    /// Lowercase kind, used in ownership tags.
    const KIND: &'static str;
    /// Finalizer protecting the provider resources of this kind.
    const FINALIZER: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_failure(&mut self, failure: Option<Failure>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizers() {
        let mut meta = ObjectMeta::new("default", "c1");
        assert!(meta.add_finalizer("f"));
        assert!(!meta.add_finalizer("f"));
        assert!(meta.has_finalizer("f"));
        assert!(meta.remove_finalizer("f"));
        assert!(!meta.remove_finalizer("f"));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, READY_CONDITION, ConditionStatus::False, "Creating", "");
        let first = conditions[0].last_transition_time;

        set_condition(&mut conditions, READY_CONDITION, ConditionStatus::False, "Waiting", "x");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason, "Waiting");

        set_condition(&mut conditions, READY_CONDITION, ConditionStatus::True, "Ready", "");
        assert!(conditions[0].last_transition_time >= first);
        assert_eq!(
            find_condition(&conditions, READY_CONDITION).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[test]
    fn test_meta_deserializes_camel_case() {
        let meta: ObjectMeta = serde_json::from_str(
            r#"{"name":"c1","namespace":"ns","deletionTimestamp":"2025-01-01T00:00:00Z",
                "labels":{"cluster.x-k8s.io/cluster-name":"c1"}}"#,
        )
        .unwrap();
        assert!(meta.is_deleting());
        assert_eq!(meta.cluster_name(), Some("c1"));
    }
}
