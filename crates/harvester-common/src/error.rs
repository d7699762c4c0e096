//! Error types for the Harvester machine driver
//!
//! Errors are structured with fields so that a failed lifecycle step can be
//! identified from the message alone. Each variant maps to one class of
//! failure: configuration, network-data validation, external resources,
//! polling exhaustion, or local filesystem access.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for driver operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Transport error talking to the legacy Harvester REST API
    #[error("http error: {source}")]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// Non-success response from the legacy Harvester REST API
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Invalid driver configuration (missing fields, bad combinations)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending flag, if known
        field: Option<String>,
    },

    /// Network-data document failed structural validation
    #[error("invalid network data: {message}")]
    NetworkData {
        /// Description of what's invalid
        message: String,
        /// The missing or malformed section (e.g. "subnets")
        section: Option<String>,
    },

    /// A referenced resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "image", "network")
        kind: String,
        /// Namespaced name of the resource
        name: String,
    },

    /// A resource that must not exist already does
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Namespaced name of the resource
        name: String,
    },

    /// Bounded polling ran out of attempts
    #[error(
        "too many retries waiting for {operation} after {attempts} attempts. Last error: {}",
        last_error.as_deref().unwrap_or("none")
    )]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed while polling
        last_error: Option<String>,
    },

    /// Local filesystem error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What the driver was doing
        context: String,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a specific flag
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a network-data error without section context
    pub fn network_data(msg: impl Into<String>) -> Self {
        Self::NetworkData {
            message: msg.into(),
            section: None,
        }
    }

    /// Create a network-data error for a missing section
    pub fn missing_section(section: impl Into<String>) -> Self {
        let section = section.into();
        Self::NetworkData {
            message: format!("missing section: {}", section),
            section: Some(section),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a polling timeout error
    pub fn timeout(
        operation: impl Into<String>,
        attempts: u32,
        last_error: Option<String>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
            last_error,
        }
    }

    /// Wrap an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if the error means the target resource does not exist
    ///
    /// Covers both our own `NotFound` and 404 responses from either API
    /// generation.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Api { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Returns true if the error means the resource already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            Error::Api { status, .. } => *status == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization_for_kind("yaml", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    #[test]
    fn not_found_covers_both_api_generations() {
        assert!(Error::not_found("image", "default/ubuntu").is_not_found());
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(Error::Api {
            status: 404,
            message: "missing".to_string()
        }
        .is_not_found());
        assert!(!api_error(500, "InternalError").is_not_found());
    }

    #[test]
    fn already_exists_requires_conflict_reason() {
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "Conflict").is_already_exists());
    }

    #[test]
    fn timeout_message_carries_last_error() {
        let err = Error::timeout("machine to be running", 24, Some("vmi not ready".to_string()));
        let msg = err.to_string();
        assert!(msg.contains("machine to be running"));
        assert!(msg.contains("24 attempts"));
        assert!(msg.contains("vmi not ready"));

        let err = Error::timeout("machine removed", 3, None);
        assert!(err.to_string().ends_with("Last error: none"));
    }

    #[test]
    fn missing_section_names_the_key() {
        match Error::missing_section("subnets") {
            Error::NetworkData { message, section } => {
                assert_eq!(message, "missing section: subnets");
                assert_eq!(section.as_deref(), Some("subnets"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
