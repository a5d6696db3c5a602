//! Correction rules applied to rendered objects
//!
//! Each rule mutates one typed object in place and depends only on the object
//! and the [`TransformConfig`]. Rules are idempotent: running one twice gives
//! the same object as running it once.

use crate::transformer::TransformConfig;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    PodAffinityTerm, PodAntiAffinity, Service, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Resource name for CPU in limit/request maps
pub const RESOURCE_CPU: &str = "cpu";

/// Resource name for memory in limit/request maps
pub const RESOURCE_MEMORY: &str = "memory";

/// Service type that gets a virtual IP allocated
const SERVICE_TYPE_CLUSTER_IP: &str = "ClusterIP";

/// `clusterIP` value that makes a service headless
const CLUSTER_IP_NONE: &str = "None";

/// A named mutation for objects of kind `K`
pub struct Rule<K> {
    /// Rule name, used in logs
    pub name: &'static str,
    /// The mutation
    pub apply: fn(&mut K, &TransformConfig),
}

impl<K> Clone for Rule<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Rule<K> {}

impl<K> std::fmt::Debug for Rule<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

/// Spread replicas across hosts
pub const POD_ANTI_AFFINITY: Rule<Deployment> = Rule {
    name: "pod-anti-affinity",
    apply: ensure_pod_anti_affinity,
};

/// Fill in missing CPU/memory limits
pub const DEFAULT_RESOURCE_LIMITS: Rule<Deployment> = Rule {
    name: "default-resource-limits",
    apply: set_default_resource_limits,
};

/// Turn ClusterIP services headless
pub const HEADLESS_SERVICE: Rule<Service> = Rule {
    name: "headless-service",
    apply: force_headless_service,
};

/// Replace the pod anti-affinity with a single preferred per-host term.
///
/// The term selects the Deployment's own pods through `spec.selector`. Any
/// existing anti-affinity (preferred or required) is dropped; node and pod
/// affinity are left alone.
pub fn ensure_pod_anti_affinity(deployment: &mut Deployment, config: &TransformConfig) {
    let Some(spec) = deployment.spec.as_mut() else {
        return;
    };
    let selector = spec.selector.clone();
    let Some(pod_spec) = spec.template.spec.as_mut() else {
        return;
    };

    let affinity = pod_spec.affinity.get_or_insert_with(Default::default);
    affinity.pod_anti_affinity = Some(PodAntiAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![
            WeightedPodAffinityTerm {
                weight: config.anti_affinity_weight,
                pod_affinity_term: PodAffinityTerm {
                    topology_key: config.topology_key.clone(),
                    label_selector: Some(selector),
                    ..Default::default()
                },
            },
        ]),
        required_during_scheduling_ignored_during_execution: None,
    });
}

/// Set CPU and memory limits on every container that lacks them.
///
/// Explicit limits are never overwritten.
pub fn set_default_resource_limits(deployment: &mut Deployment, config: &TransformConfig) {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return;
    };

    for container in &mut pod_spec.containers {
        let limits = container
            .resources
            .get_or_insert_with(Default::default)
            .limits
            .get_or_insert_with(Default::default);
        limits
            .entry(RESOURCE_CPU.to_string())
            .or_insert_with(|| Quantity(config.default_cpu_limit.clone()));
        limits
            .entry(RESOURCE_MEMORY.to_string())
            .or_insert_with(|| Quantity(config.default_memory_limit.clone()));
    }
}

/// Clear the virtual IP of a ClusterIP service.
///
/// An unset type counts as ClusterIP since that is the API server default.
pub fn force_headless_service(service: &mut Service, _config: &TransformConfig) {
    let Some(spec) = service.spec.as_mut() else {
        return;
    };
    let is_cluster_ip = spec
        .type_
        .as_deref()
        .is_none_or(|t| t == SERVICE_TYPE_CLUSTER_IP);
    if !is_cluster_ip {
        return;
    }

    spec.cluster_ip = Some(CLUSTER_IP_NONE.to_string());
    if let Some(ips) = spec.cluster_ips.as_mut() {
        *ips = vec![CLUSTER_IP_NONE.to_string()];
    }
}
