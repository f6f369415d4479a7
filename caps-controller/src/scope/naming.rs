//! Deterministic names and ownership tags of provider resources.

use sha2::{Digest, Sha256};

/// Longest name accepted by every provider product.
pub const MAX_NAME_LEN: usize = 63;

const HASH_LEN: usize = 8;

/// `<prefix>-<base>[-<suffix>...]`.
///
/// Names longer than [`MAX_NAME_LEN`] are cut and end with a hash of the
/// full name, so distinct inputs keep distinct names.
pub fn resource_name(prefix: &str, base: &str, suffixes: &[&str]) -> String {
    let mut name = format!("{}-{}", prefix, base);
    for suffix in suffixes {
        name.push('-');
        name.push_str(suffix);
    }
    if name.len() <= MAX_NAME_LEN {
        return name;
    }

    let digest = Sha256::digest(name.as_bytes());
    let hash: String = digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    let keep = MAX_NAME_LEN - HASH_LEN - 1;
    let head = name[..keep].trim_end_matches('-');
    format!("{}-{}", head, hash)
}

/// Tag carrying the owner's identity: `<prefix>-<kind>=<name>`.
pub fn owner_tag(prefix: &str, kind: &str, name: &str) -> String {
    format!("{}-{}={}", prefix, kind, name)
}

/// Ownership marker of untagged resources such as DNS records:
/// `<prefix>-<kind>=<namespace>/<name>`.
pub fn record_owner(prefix: &str, namespace: &str, kind: &str, name: &str) -> String {
    format!("{}-{}={}/{}", prefix, kind, namespace, name)
}

/// Tags every resource of an owner carries, followed by `extra`.
pub fn resource_tags(
    prefix: &str,
    namespace: &str,
    kind: &str,
    name: &str,
    extra: &[&str],
) -> Vec<String> {
    let mut tags = vec![
        prefix.to_string(),
        format!("{}-namespace={}", prefix, namespace),
        owner_tag(prefix, kind, name),
    ];
    tags.extend(extra.iter().map(|t| t.to_string()));
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names() {
        assert_eq!(resource_name("caps", "c1", &[]), "caps-c1");
        assert_eq!(resource_name("caps", "c1", &["0"]), "caps-c1-0");
        assert_eq!(resource_name("caps", "c1", &["lb", "2"]), "caps-c1-lb-2");
    }

    #[test]
    fn test_long_names_are_truncated_and_distinct() {
        let base = "a".repeat(70);
        let first = resource_name("caps", &base, &["0"]);
        let second = resource_name("caps", &base, &["1"]);

        assert_eq!(first.len(), MAX_NAME_LEN);
        assert_eq!(second.len(), MAX_NAME_LEN);
        assert_ne!(first, second);
        assert_eq!(first, resource_name("caps", &base, &["0"]));
    }

    #[test]
    fn test_record_owner_includes_namespace() {
        let a = record_owner("caps", "team-a", "scalewaycluster", "c1");
        let b = record_owner("caps", "team-b", "scalewaycluster", "c1");

        assert_eq!(a, "caps-scalewaycluster=team-a/c1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_resource_tags() {
        let tags = resource_tags("caps", "ns", "scalewaycluster", "c1", &["caps-managed-ip"]);
        assert_eq!(
            tags,
            vec![
                "caps",
                "caps-namespace=ns",
                "caps-scalewaycluster=c1",
                "caps-managed-ip"
            ]
        );
    }
}
