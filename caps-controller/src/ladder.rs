//! Commercial type ladders.
//!
//! Providers declare the commercial types of a product in a total order
//! (e.g. `VPC-GW-S < VPC-GW-M < VPC-GW-L < VPC-GW-XL`). A resource may only
//! move strictly forward along that order, and only between known types.

use std::cmp::Ordering;

/// Result of comparing a current and a desired type on a ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upgrade {
    /// Desired type is further up the ladder.
    Forward,
    /// Types are the same; nothing to do.
    Same,
    /// Backward move, or one of the types is not on the ladder.
    NotUpgradable,
}

/// Ordered list of commercial types, smallest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLadder {
    types: Vec<String>,
}

impl TypeLadder {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Position of a type on the ladder. Type names are case-insensitive.
    pub fn position(&self, commercial_type: &str) -> Option<usize> {
        self.types
            .iter()
            .position(|t| t.eq_ignore_ascii_case(commercial_type))
    }

    pub fn upgrade(&self, current: &str, desired: &str) -> Upgrade {
        if current.eq_ignore_ascii_case(desired) {
            return Upgrade::Same;
        }
        match (self.position(current), self.position(desired)) {
            (Some(from), Some(to)) if to > from => Upgrade::Forward,
            _ => Upgrade::NotUpgradable,
        }
    }

    /// Whether `current` can be moved in place to `desired`.
    pub fn can_upgrade(&self, current: &str, desired: &str) -> bool {
        self.upgrade(current, desired) == Upgrade::Forward
    }

    /// Whether a resource of type `current` is acceptable for `desired`:
    /// the same type, or one that can be upgraded in place.
    pub fn accepts(&self, current: &str, desired: &str) -> bool {
        matches!(
            self.upgrade(current, desired),
            Upgrade::Same | Upgrade::Forward
        )
    }
}

/// Compare two Kubernetes versions such as `1.30.2` or `v1.31`.
///
/// Missing components count as zero. Returns `None` when either version is
/// not dot-separated numbers.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    fn parse(version: &str) -> Option<Vec<u64>> {
        let version = version.trim().trim_start_matches('v');
        if version.is_empty() {
            return None;
        }
        version.split('.').map(|c| c.parse().ok()).collect()
    }

    let (mut a, mut b) = (parse(a)?, parse(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}
