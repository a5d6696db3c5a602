//! Custom Resource Definitions for the Tomcat Kubernetes Operator
//!
//! This module defines the `Tomcat` CRD that declares the desired state of
//! one Tomcat deployment: version, replica count and resource requests.

use crate::quantity::CanonicalQuantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

/// Suffix appended to the instance name to name its workload and service
pub const DEFAULT_WORKLOAD_SUFFIX: &str = "-tomcat";

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    match CanonicalQuantity::parse(value) {
        Ok(q) if q.as_nanos() > 0 => Ok(()),
        Ok(_) => Err(ValidationError::new("non_positive_quantity")
            .with_message(format!("'{}' must be greater than zero", value).into())),
        Err(_) => Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into())),
    }
}

/// Tomcat custom resource definition
///
/// The operator renders a Deployment and a Service for each Tomcat resource
/// and keeps the live Deployment's replicas and resource requests in line
/// with `spec`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[kube(
    group = "tomcat.opencanon.com",
    version = "v1",
    kind = "Tomcat",
    plural = "tomcats",
    shortname = "tc",
    namespaced,
    status = "TomcatStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TomcatSpec {
    /// Tomcat version, used as the image tag
    #[serde(default = "default_version")]
    #[validate(length(min = 1, max = 128, message = "version must be 1-128 characters"))]
    pub version: String,

    /// Number of Tomcat replicas (at least 1)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, message = "replicas must be at least 1"))]
    pub replicas: i32,

    /// Compute resources for the Tomcat container
    #[serde(default)]
    #[validate(nested)]
    pub resources: TomcatResources,
}

/// Compute resources of the Tomcat container
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TomcatResources {
    /// Resource requests
    #[serde(default)]
    #[validate(nested)]
    pub requests: TomcatRequests,
}

/// CPU and memory requests
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TomcatRequests {
    /// CPU request (e.g., "250m")
    #[serde(default = "default_cpu_request")]
    #[validate(custom(function = "validate_quantity"))]
    pub cpu: String,

    /// Memory request (e.g., "256Mi")
    #[serde(default = "default_memory_request")]
    #[validate(custom(function = "validate_quantity"))]
    pub memory: String,
}

impl Default for TomcatRequests {
    fn default() -> Self {
        Self {
            cpu: default_cpu_request(),
            memory: default_memory_request(),
        }
    }
}

/// Status of a Tomcat resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TomcatStatus {
    /// Current phase
    pub phase: TomcatPhase,

    /// Total number of replicas
    pub replicas: i32,

    /// Number of ready replicas
    pub ready_replicas: i32,

    /// Number of updated replicas
    pub updated_replicas: i32,

    /// Current observed generation
    pub observed_generation: i64,

    /// Conditions describing instance state
    #[serde(default)]
    pub conditions: Vec<TomcatCondition>,

    /// Last time the status was updated
    pub last_updated: Option<String>,

    /// Error message if any
    pub message: Option<String>,
}

/// Phase of the instance lifecycle
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TomcatPhase {
    /// Nothing observed yet
    #[default]
    Pending,
    /// Workload exists but no replica is ready
    Provisioning,
    /// All desired replicas are ready
    Running,
    /// A rollout is in progress
    Updating,
    /// Fewer replicas ready than desired
    Degraded,
}

/// Condition describing an aspect of instance state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TomcatCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last transition time
    pub last_transition_time: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_version() -> String {
    "10.1".to_string()
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_memory_request() -> String {
    "256Mi".to_string()
}

/// Name of the workload (Deployment and Service) managed for an instance
pub fn workload_name(instance: &str, suffix: &str) -> String {
    format!("{}{}", instance, suffix)
}

impl TomcatSpec {
    /// Get labels for managed resources
    pub fn get_labels(&self, instance: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(instance);
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "server".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "tomcat-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.version.clone(),
        );
        labels
    }

    /// Get selector labels (stable across upgrades)
    pub fn get_selector_labels(&self, instance: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "tomcat".to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            instance.to_string(),
        );
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: i32, cpu: &str, memory: &str) -> TomcatSpec {
        TomcatSpec {
            version: "10.1".to_string(),
            replicas,
            resources: TomcatResources {
                requests: TomcatRequests {
                    cpu: cpu.to_string(),
                    memory: memory.to_string(),
                },
            },
        }
    }

    #[test]
    fn test_defaults_from_empty_spec() {
        let spec: TomcatSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.resources.requests.cpu, "100m");
        assert_eq!(spec.resources.requests.memory, "256Mi");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_camel_case_fields() {
        let spec: TomcatSpec = serde_json::from_value(serde_json::json!({
            "version": "9.0",
            "replicas": 3,
            "resources": { "requests": { "cpu": "250m", "memory": "512Mi" } }
        }))
        .unwrap();
        assert_eq!(spec, self::spec(3, "250m", "512Mi").with_version("9.0"));
    }

    #[test]
    fn test_replicas_must_be_positive() {
        assert!(spec(0, "100m", "256Mi").validate().is_err());
        assert!(spec(1, "100m", "256Mi").validate().is_ok());
    }

    #[test]
    fn test_requests_must_be_quantities() {
        let errors = spec(1, "a lot", "256Mi").validate().unwrap_err();
        assert!(errors.errors().contains_key("resources"));
        assert!(spec(1, "100m", "-1Gi").validate().is_err());
        assert!(spec(1, "0.5", "1e9").validate().is_ok());
        assert!(spec(1, "1e2147483647", "256Mi").validate().is_err());
    }

    #[test]
    fn test_labels() {
        let spec = spec(1, "100m", "256Mi");
        let labels = spec.get_labels("web");
        assert_eq!(
            labels.get("app.kubernetes.io/instance"),
            Some(&"web".to_string())
        );
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&"tomcat-operator".to_string())
        );
        let selector = spec.get_selector_labels("web");
        assert_eq!(selector.len(), 2);
        assert!(selector.iter().all(|(k, v)| labels.get(k) == Some(v)));
    }

    #[test]
    fn test_workload_name() {
        assert_eq!(workload_name("web", DEFAULT_WORKLOAD_SUFFIX), "web-tomcat");
    }

    #[test]
    fn test_crd_generation() {
        use kube::CustomResourceExt;

        let crd = Tomcat::crd();
        assert_eq!(crd.spec.group, "tomcat.opencanon.com");
        assert_eq!(crd.spec.names.kind, "Tomcat");
        assert_eq!(crd.spec.names.plural, "tomcats");
    }

    impl TomcatSpec {
        fn with_version(mut self, version: &str) -> Self {
            self.version = version.to_string();
            self
        }
    }
}
