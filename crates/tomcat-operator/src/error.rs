//! Error types for the Tomcat Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Live object exists but lacks a container, request map or request key
    #[error("Missing resource field on {name} in namespace {namespace}: {field}")]
    MissingResource {
        name: String,
        namespace: String,
        field: String,
    },

    /// Typed/generic representation conversion failed
    #[error("Conversion error for {kind}: {message}")]
    Conversion { kind: String, message: String },

    /// Quantity string could not be parsed
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Conditional update kept losing to concurrent writers
    #[error("Update conflict on {kind}/{name} after {attempts} attempts")]
    Conflict {
        kind: String,
        name: String,
        attempts: u32,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Create a conversion error for the given kind
    pub fn conversion(kind: impl Into<String>, message: impl Into<String>) -> Self {
        OperatorError::Conversion {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a missing-field error for a live workload
    pub fn missing(
        name: impl Into<String>,
        namespace: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        OperatorError::MissingResource {
            name: name.into(),
            namespace: namespace.into(),
            field: field.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::NotFound { .. }
                | OperatorError::Conflict { .. }
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            OperatorError::Conflict { .. } => Some(std::time::Duration::from_secs(5)),
            e if e.is_retryable() => Some(std::time::Duration::from_secs(30)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::NotFound {
            kind: "Deployment".to_string(),
            name: "web-tomcat".to_string(),
            namespace: "default".to_string(),
        };
        assert!(err.to_string().contains("Deployment"));
        assert!(err.to_string().contains("web-tomcat"));
    }

    #[test]
    fn test_missing_resource_display() {
        let err = OperatorError::missing("web-tomcat", "prod", "containers[0]");
        let msg = err.to_string();
        assert!(msg.contains("web-tomcat"));
        assert!(msg.contains("prod"));
        assert!(msg.contains("containers[0]"));
    }

    #[test]
    fn test_retryable_errors() {
        let not_found = OperatorError::NotFound {
            kind: "Deployment".to_string(),
            name: "x".to_string(),
            namespace: "default".to_string(),
        };
        assert!(not_found.is_retryable());

        let conversion = OperatorError::conversion("Deployment", "bad tree");
        assert!(!conversion.is_retryable());

        let missing = OperatorError::missing("x", "default", "resources.requests");
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let conflict = OperatorError::Conflict {
            kind: "Deployment".to_string(),
            name: "x".to_string(),
            attempts: 4,
        };
        assert_eq!(
            conflict.requeue_delay(),
            Some(std::time::Duration::from_secs(5))
        );

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }
}
