//! Generic convergence of an ordered desired list against provider resources.
//!
//! A [`ResourceAdapter`] describes one resource kind (gateways, load
//! balancers, DNS records, ...). [`ResourceEnsurer::ensure`] makes the
//! resources owned by the caller match the desired list in one pass:
//!
//! 1. list owned resources (tag query only)
//! 2. match every desired entry to a resource by `(zone, name)`
//! 3. keep matched resources the adapter accepts, updating them in place
//! 4. delete stale and unaddressed resources
//! 5. create the missing ones
//!
//! Matching never depends on list position, so the pass can be re-run from
//! scratch after any failure and picks up where the previous one stopped.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ReconcileError;

/// Per-kind plug-in used by [`ResourceEnsurer`].
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// One element of the desired list.
    type Desired: Send + Sync;
    /// A resource as observed at the provider.
    type Resource: Clone + Send + Sync;
    /// Locality resources are matched in (zone, region or DNS zone).
    type Zone: Clone + Eq + Hash + Display + Send + Sync;

    /// Resource kind, for logs and error messages.
    fn kind(&self) -> &'static str;

    /// List every resource carrying the owner's tags.
    async fn list_resources(&self) -> Result<Vec<Self::Resource>>;

    fn resource_id(&self, resource: &Self::Resource) -> String;

    fn resource_name(&self, resource: &Self::Resource) -> String;

    fn resource_zone(&self, resource: &Self::Resource) -> Self::Zone;

    /// Zone a desired entry must live in.
    fn desired_zone(&self, desired: &Self::Desired) -> Result<Self::Zone>;

    /// Canonical name of the desired entry at `index`. Must be injective
    /// over `index` for a given owner.
    fn desired_name(&self, index: usize, desired: &Self::Desired) -> String;

    /// Pre-existing resource the user wants reused as-is.
    fn desired_id(&self, _desired: &Self::Desired) -> Option<String> {
        None
    }

    /// Fetch a user-managed resource by ID.
    async fn get_resource(&self, zone: &Self::Zone, id: &str) -> Result<Option<Self::Resource>>;

    /// Whether a matched resource is acceptable for `desired`. Rejected
    /// resources are deleted and recreated.
    async fn should_keep_resource(
        &self,
        resource: &Self::Resource,
        desired: &Self::Desired,
    ) -> Result<bool>;

    /// Apply safe in-place changes to a kept resource. Must not call the
    /// provider when nothing differs.
    async fn update_resource(
        &self,
        resource: Self::Resource,
        desired: &Self::Desired,
    ) -> Result<Self::Resource>;

    async fn create_resource(
        &self,
        zone: &Self::Zone,
        name: &str,
        desired: &Self::Desired,
    ) -> Result<Self::Resource>;

    async fn delete_resource(&self, resource: &Self::Resource) -> Result<()>;
}

/// What the pass decided for one desired entry.
enum Slot<Z> {
    /// User-managed resource, fetched by ID.
    Adopt { zone: Z, id: String },
    /// Matched resource that is kept (index into the observed list).
    Keep(usize),
    /// Nothing acceptable exists yet.
    Create { zone: Z, name: String },
}

/// Converges resources of one kind toward a desired list.
pub struct ResourceEnsurer<A> {
    adapter: A,
}

impl<A: ResourceAdapter> ResourceEnsurer<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Run one convergence pass.
    ///
    /// Returns the resulting resources in desired order. The first failing
    /// provider call aborts the pass.
    pub async fn ensure(&self, desired: &[A::Desired]) -> Result<Vec<A::Resource>> {
        let kind = self.adapter.kind();
        let observed = self
            .adapter
            .list_resources()
            .await
            .with_context(|| format!("failed to list {} resources", kind))?;

        let (slots, doomed) = self.plan(desired, &observed).await?;

        for index in doomed {
            let resource = &observed[index];
            info!(
                kind,
                name = %self.adapter.resource_name(resource),
                zone = %self.adapter.resource_zone(resource),
                "Deleting resource"
            );
            self.adapter.delete_resource(resource).await.with_context(|| {
                format!(
                    "failed to delete {} {}",
                    kind,
                    self.adapter.resource_id(resource)
                )
            })?;
        }

        let mut converged = Vec::with_capacity(desired.len());
        for (slot, want) in slots.into_iter().zip(desired) {
            let resource = match slot {
                Slot::Adopt { zone, id } => {
                    debug!(kind, id = %id, "Using user-provided resource");
                    self.adapter
                        .get_resource(&zone, &id)
                        .await
                        .with_context(|| format!("failed to get {} {}", kind, id))?
                        .ok_or_else(|| {
                            ReconcileError::terminal(format!(
                                "{} {} not found in zone {}",
                                kind, id, zone
                            ))
                        })?
                }
                Slot::Keep(index) => {
                    let current = observed[index].clone();
                    let id = self.adapter.resource_id(&current);
                    self.adapter
                        .update_resource(current, want)
                        .await
                        .with_context(|| format!("failed to update {} {}", kind, id))?
                }
                Slot::Create { zone, name } => {
                    info!(kind, name = %name, zone = %zone, "Creating resource");
                    self.adapter
                        .create_resource(&zone, &name, want)
                        .await
                        .with_context(|| format!("failed to create {} {}", kind, name))?
                }
            };
            converged.push(resource);
        }

        Ok(converged)
    }

    /// Decide a slot for every desired entry and the set of observed
    /// resources to delete. Makes no mutating provider call.
    async fn plan(
        &self,
        desired: &[A::Desired],
        observed: &[A::Resource],
    ) -> Result<(Vec<Slot<A::Zone>>, Vec<usize>)> {
        let kind = self.adapter.kind();

        let mut by_key: HashMap<(A::Zone, String), Vec<usize>> = HashMap::new();
        for (index, resource) in observed.iter().enumerate() {
            by_key
                .entry((
                    self.adapter.resource_zone(resource),
                    self.adapter.resource_name(resource),
                ))
                .or_default()
                .push(index);
        }

        let mut adopted_ids = HashSet::new();
        let mut seen_keys = HashSet::new();
        let mut claimed = HashSet::new();
        let mut slots = Vec::with_capacity(desired.len());

        for (index, want) in desired.iter().enumerate() {
            let zone = self.adapter.desired_zone(want)?;

            if let Some(id) = self.adapter.desired_id(want) {
                adopted_ids.insert(id.clone());
                slots.push(Slot::Adopt { zone, id });
                continue;
            }

            let name = self.adapter.desired_name(index, want);
            let key = (zone, name);
            if !seen_keys.insert(key.clone()) {
                return Err(ReconcileError::terminal(format!(
                    "two desired {} resources resolve to {} in zone {}",
                    kind, key.1, key.0
                ))
                .into());
            }

            let mut kept = None;
            for &candidate in by_key.get(&key).map(Vec::as_slice).unwrap_or_default() {
                if kept.is_none()
                    && self
                        .adapter
                        .should_keep_resource(&observed[candidate], want)
                        .await?
                {
                    kept = Some(candidate);
                    claimed.insert(candidate);
                }
            }

            let (zone, name) = key;
            slots.push(match kept {
                Some(candidate) => Slot::Keep(candidate),
                None => Slot::Create { zone, name },
            });
        }

        let doomed = (0..observed.len())
            .filter(|index| !claimed.contains(index))
            .filter(|&index| !adopted_ids.contains(&self.adapter.resource_id(&observed[index])))
            .collect();

        Ok((slots, doomed))
    }
}
