//! Label derivation for machine grouping
//!
//! Machine names follow `<cluster>-<pool>-<generated>-<generated>`. Stripping
//! the generated suffix yields a stable machine-set key used for labels and
//! affinity terms, so every retry for the same machine lands in the same group.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use harvester_common::{Error, Result};

/// Label carrying the derived machine-set grouping key
pub const MACHINE_SET_NAME_LABEL: &str = "harvesterhci.io/machineSetName";

/// Label carrying the guest cluster name
pub const CLUSTER_NAME_LABEL: &str = "guestcluster.harvesterhci.io/name";

/// Label carrying the node pool name
pub const POOL_NAME_LABEL: &str = "nodepool.harvesterhci.io/name";

/// Maximum length of a Kubernetes label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Return `value` if it is a valid Kubernetes label value, otherwise a stable
/// hash of it that is.
///
/// The hash is `hash_<base64url(fnv32a(value))>_z`; the `_z` suffix keeps the
/// last character alphanumeric.
pub fn format_label_value(value: &str) -> String {
    if is_valid_label_value(value) {
        return value.to_string();
    }
    format!(
        "hash_{}_z",
        URL_SAFE_NO_PAD.encode(fnv32a(value.as_bytes()).to_be_bytes())
    )
}

/// Kubernetes label value grammar: empty, or at most 63 characters of
/// `[A-Za-z0-9._-]` starting and ending with an alphanumeric.
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: &u8| b.is_ascii_alphanumeric();
    bytes.first().is_some_and(edge_ok)
        && bytes.last().is_some_and(edge_ok)
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn fnv32a(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV32_PRIME)
    })
}

/// Grouping key for a machine: namespace plus the machine name without its
/// two trailing generated segments, formatted as a label value.
pub fn machine_set_label(namespace: &str, machine_name: &str) -> String {
    let segments: Vec<&str> = std::iter::once(namespace)
        .chain(machine_name.split('-'))
        .collect();
    let keep = segments.len().saturating_sub(2);
    format_label_value(&segments[..keep].join("-"))
}

/// Node pool name: the machine name up to its last segment, minus the
/// cluster-name prefix and any leading dashes.
pub fn node_pool_name(machine_name: &str, cluster_name: &str) -> String {
    let without_suffix = match machine_name.rfind('-') {
        Some(idx) => &machine_name[..idx],
        None => machine_name,
    };
    without_suffix
        .strip_prefix(cluster_name)
        .unwrap_or(without_suffix)
        .trim_start_matches('-')
        .to_string()
}

/// Parse `k1=v1,k2=v2` into labels; values are passed through
/// [`format_label_value`].
pub fn parse_labels(input: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    if input.is_empty() {
        return Ok(labels);
    }
    for pair in input.split(',') {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::validation_for_field(
                "harvester-vm-labels",
                format!("parse labels syntax error: {pair:?} is not key=value"),
            )
        })?;
        labels.insert(key.to_string(), format_label_value(value));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";
    const DIGITS: &str = "1234567890";

    #[test]
    fn valid_values_are_unchanged() {
        assert_eq!(format_label_value(""), "");
        assert_eq!(format_label_value("machineSetName"), "machineSetName");
        assert_eq!(format_label_value("default-rke2-pool1"), "default-rke2-pool1");
    }

    #[test]
    fn long_values_hash_deterministically() {
        let long = "machineSetName".repeat(12);
        assert_eq!(format_label_value(&long), "hash_FR_ghQ_z");

        let long = format!("{ALPHABET}{DIGITS}{ALPHABET}{DIGITS}");
        assert_eq!(format_label_value(&long), "hash_09h0hQ_z");
    }

    #[test]
    fn formatting_is_idempotent() {
        let long = "x".repeat(64);
        for input in [
            "",
            "pool",
            "-leading-dash",
            "trailing.",
            "has/slash",
            long.as_str(),
        ] {
            let once = format_label_value(input);
            assert!(is_valid_label_value(&once), "{once} is not a label value");
            assert_eq!(format_label_value(&once), once);
        }
    }

    #[test]
    fn label_grammar_edges() {
        assert!(is_valid_label_value(&"a".repeat(63)));
        assert!(!is_valid_label_value(&"a".repeat(64)));
        assert!(!is_valid_label_value("-a"));
        assert!(!is_valid_label_value("a_"));
        assert!(!is_valid_label_value("a b"));
        assert!(is_valid_label_value("a.b_c-d"));
    }

    #[test]
    fn machine_set_drops_generated_segments() {
        assert_eq!(
            machine_set_label("default", "rke2-pool1-5d8f7b-x2kzl"),
            "default-rke2-pool1"
        );
        assert_eq!(machine_set_label("fleet", "node"), "");
    }

    #[test]
    fn machine_set_hashes_long_names() {
        let name = format!("{}-pool-abcde-fghij", "x".repeat(70));
        let label = machine_set_label("default", &name);
        assert_eq!(label, format_label_value(&format!("default-{}-pool", "x".repeat(70))));
        assert!(label.starts_with("hash_"));
    }

    #[test]
    fn pool_name_trims_cluster_prefix() {
        assert_eq!(node_pool_name("rke2-pool1-5d8f7b-x2kzl", "rke2"), "pool1-5d8f7b");
        assert_eq!(node_pool_name("other-pool-abc", "rke2"), "other-pool");
        assert_eq!(node_pool_name("single", "rke2"), "single");
    }

    #[test]
    fn parse_labels_formats_values() {
        assert!(parse_labels("").unwrap().is_empty());

        let labels = parse_labels(&format!(
            "foo=bar,baz={ALPHABET}{DIGITS}{ALPHABET}{DIGITS},xxx=yyy"
        ))
        .unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["foo"], "bar");
        assert_eq!(labels["baz"], "hash_09h0hQ_z");
        assert_eq!(labels["xxx"], "yyy");
    }

    #[test]
    fn parse_labels_rejects_pair_without_value() {
        let err = parse_labels("foo=bar,baz,xxx=yyy").unwrap_err();
        assert!(err.to_string().contains("parse labels syntax error"));
    }
}
