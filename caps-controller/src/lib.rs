//! caps-controller: converges Scaleway infrastructure toward the desired
//! state of Cluster API objects.
//!
//! A reconciliation flows through three layers:
//! - controller: per-kind state machine with readiness gates and finalizers
//! - reconciler: ordered sub-reconcilers, one per provider product
//! - ensurer: find, create, update and delete of one resource kind
//!
//! Every error a reconciler returns is classified as transient (requeue),
//! terminal (record a failure) or unclassified (propagate).

pub mod api;
pub mod clients;
pub mod config;
pub mod controller;
pub mod ensurer;
pub mod error;
pub mod ladder;
pub mod reconciler;
pub mod scope;
pub mod telemetry;
pub mod test_util;

pub use config::ControllerConfig;
pub use controller::{Action, Context};
pub use error::{Outcome, ReconcileError, classify};
