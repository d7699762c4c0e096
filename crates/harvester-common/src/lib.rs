//! Common types for the Harvester machine driver: resources, errors, and utilities

pub mod crd;
pub mod error;
pub mod poll;
pub mod yaml;

pub use error::Error;
pub use poll::{poll_until, PollConfig};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace used when a reference carries none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Value of the creator label on every VM the driver creates
pub const DRIVER_CREATOR: &str = "docker-machine-driver-harvester";

/// Split `"name"` or `"namespace/name"` into its parts.
///
/// The namespace is empty when the reference carries none. More than one `/`
/// is an error.
pub fn namespaced_name_parts(namespaced_name: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = namespaced_name.split('/').collect();
    match parts.as_slice() {
        [name] => Ok((String::new(), (*name).to_string())),
        [namespace, name] => Ok(((*namespace).to_string(), (*name).to_string())),
        _ => Err(Error::validation(format!(
            "unexpected namespacedName format ({:?}), expected \"namespace/name\" or \"name\"",
            namespaced_name
        ))),
    }
}

/// Like [`namespaced_name_parts`], substituting `default_namespace` when the
/// reference has no namespace.
pub fn namespaced_name_parts_or(
    namespaced_name: &str,
    default_namespace: &str,
) -> Result<(String, String)> {
    let (namespace, name) = namespaced_name_parts(namespaced_name)?;
    if namespace.is_empty() {
        Ok((default_namespace.to_string(), name))
    } else {
        Ok((namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_default_namespace() {
        assert_eq!(
            namespaced_name_parts_or("ubuntu", DEFAULT_NAMESPACE).unwrap(),
            ("default".to_string(), "ubuntu".to_string())
        );
        assert_eq!(
            namespaced_name_parts("ubuntu").unwrap(),
            (String::new(), "ubuntu".to_string())
        );
    }

    #[test]
    fn explicit_namespace_is_kept() {
        assert_eq!(
            namespaced_name_parts_or("images/ubuntu", "default").unwrap(),
            ("images".to_string(), "ubuntu".to_string())
        );
    }

    #[test]
    fn three_segments_are_rejected() {
        let err = namespaced_name_parts("a/b/c").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("a/b/c"));
    }
}
