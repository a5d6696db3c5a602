//! Drift correction for the live Tomcat workload
//!
//! Server-side apply persists what the renderer produced, but the live
//! Deployment can still diverge: other actors scale it, or edit its
//! requests. After each apply the reconciler fetches the workload, compares
//! the fields the Tomcat spec owns and writes them back with a conditional
//! replace when they differ.

use crate::crd::{workload_name, Tomcat, DEFAULT_WORKLOAD_SUFFIX};
use crate::error::{OperatorError, Result};
use crate::quantity::{same_quantity, CanonicalQuantity};
use crate::rules::{RESOURCE_CPU, RESOURCE_MEMORY};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

/// Replica count the API server assumes when `spec.replicas` is absent
const DEFAULT_API_REPLICAS: i32 = 1;

/// Settings for drift correction
#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    /// Suffix appended to the instance name to find the workload
    pub workload_suffix: String,
    /// Re-fetch and retry this many times after a write conflict
    pub max_conflict_retries: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            workload_suffix: DEFAULT_WORKLOAD_SUFFIX.to_string(),
            max_conflict_retries: 3,
        }
    }
}

/// Access to live Deployments
///
/// `replace` must be conditional on the `resourceVersion` carried by the
/// object and report a lost race as [`OperatorError::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a Deployment; [`OperatorError::NotFound`] if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Replace a Deployment
    async fn replace(&self, namespace: &str, name: &str, deployment: &Deployment)
        -> Result<Deployment>;
}

/// [`WorkloadClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a client over the given Kubernetes connection
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Deployment".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), deployment)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref resp) if resp.code == 409 => OperatorError::Conflict {
                    kind: "Deployment".to_string(),
                    name: name.to_string(),
                    attempts: 1,
                },
                other => OperatorError::from(other),
            })
    }
}

/// Result of a single sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Live state already matched; nothing was written
    InSync,
    /// The workload was updated
    Updated,
}

/// Counters for drift corrections
#[derive(Clone)]
pub struct DriftMetrics {
    /// Replica count rewritten
    pub replica_corrections: metrics::Counter,
    /// Resource requests rewritten
    pub request_corrections: metrics::Counter,
    /// Writes that lost an optimistic-lock race
    pub conflicts: metrics::Counter,
}

impl DriftMetrics {
    /// Create new drift metrics
    pub fn new() -> Self {
        Self {
            replica_corrections: metrics::counter!(
                "tomcat_operator_drift_corrections_total",
                "field" => "replicas"
            ),
            request_corrections: metrics::counter!(
                "tomcat_operator_drift_corrections_total",
                "field" => "resources.requests"
            ),
            conflicts: metrics::counter!("tomcat_operator_update_conflicts_total"),
        }
    }
}

impl Default for DriftMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Which field a sync owns
#[derive(Debug, Clone, Copy)]
enum DriftField {
    Replicas,
    Requests,
}

/// Re-applies the desired replica count and resource requests to the live
/// workload
pub struct DriftReconciler<C> {
    client: C,
    config: DriftConfig,
    metrics: Option<DriftMetrics>,
}

impl<C: WorkloadClient> DriftReconciler<C> {
    /// Create a reconciler over the given client
    pub fn new(client: C, config: DriftConfig) -> Self {
        Self {
            client,
            config,
            metrics: None,
        }
    }

    /// Record corrections and conflicts in `metrics`
    pub fn with_metrics(mut self, metrics: DriftMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configuration syncs run with
    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Make the live replica count match `spec.replicas`
    #[instrument(skip(self, tomcat), fields(name = %tomcat.name_any()))]
    pub async fn sync_replicas(&self, tomcat: &Tomcat) -> Result<SyncOutcome> {
        let desired = tomcat.spec.replicas;

        self.sync(tomcat, DriftField::Replicas, |deployment, name, namespace| {
            let spec = deployment
                .spec
                .as_mut()
                .ok_or_else(|| OperatorError::missing(name, namespace, "spec"))?;
            let live = spec.replicas.unwrap_or(DEFAULT_API_REPLICAS);
            if live == desired {
                return Ok(false);
            }

            info!(name = %name, live, desired, "Correcting replica count");
            spec.replicas = Some(desired);
            Ok(true)
        })
        .await
    }

    /// Make the first container's CPU and memory requests match `spec.resources.requests`
    #[instrument(skip(self, tomcat), fields(name = %tomcat.name_any()))]
    pub async fn sync_resource_requests(&self, tomcat: &Tomcat) -> Result<SyncOutcome> {
        let desired = &tomcat.spec.resources.requests;
        CanonicalQuantity::parse(&desired.cpu)?;
        CanonicalQuantity::parse(&desired.memory)?;

        self.sync(tomcat, DriftField::Requests, |deployment, name, namespace| {
            let container = deployment
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .and_then(|p| p.containers.first_mut())
                .ok_or_else(|| OperatorError::missing(name, namespace, "containers[0]"))?;
            let requests = container
                .resources
                .as_mut()
                .and_then(|r| r.requests.as_mut())
                .ok_or_else(|| {
                    OperatorError::missing(name, namespace, "containers[0].resources.requests")
                })?;

            let live_cpu = requests.get(RESOURCE_CPU).ok_or_else(|| {
                OperatorError::missing(name, namespace, "containers[0].resources.requests.cpu")
            })?;
            let live_memory = requests.get(RESOURCE_MEMORY).ok_or_else(|| {
                OperatorError::missing(name, namespace, "containers[0].resources.requests.memory")
            })?;

            if same_quantity(live_cpu, &desired.cpu)? && same_quantity(live_memory, &desired.memory)? {
                return Ok(false);
            }

            info!(
                name = %name,
                live_cpu = %live_cpu.0,
                live_memory = %live_memory.0,
                cpu = %desired.cpu,
                memory = %desired.memory,
                "Correcting resource requests"
            );
            requests.insert(RESOURCE_CPU.to_string(), Quantity(desired.cpu.clone()));
            requests.insert(RESOURCE_MEMORY.to_string(), Quantity(desired.memory.clone()));
            Ok(true)
        })
        .await
    }

    /// Fetch, correct and conditionally replace the workload, re-fetching
    /// after each conflict until the retry bound is spent
    ///
    /// `correct` edits the fetched object in place and returns whether it
    /// changed anything.
    async fn sync<F>(&self, tomcat: &Tomcat, field: DriftField, correct: F) -> Result<SyncOutcome>
    where
        F: Fn(&mut Deployment, &str, &str) -> Result<bool> + Send + Sync,
    {
        let namespace = tomcat.namespace().unwrap_or_else(|| "default".to_string());
        let name = workload_name(&tomcat.name_any(), &self.config.workload_suffix);
        let max_attempts = self.config.max_conflict_retries.saturating_add(1);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut deployment = self.client.get(&namespace, &name).await?;
            if !correct(&mut deployment, name.as_str(), namespace.as_str())? {
                debug!(name = %name, ?field, "Workload in sync");
                return Ok(SyncOutcome::InSync);
            }

            match self.client.replace(&namespace, &name, &deployment).await {
                Ok(_) => {
                    self.record_correction(field);
                    return Ok(SyncOutcome::Updated);
                }
                Err(OperatorError::Conflict { kind, .. }) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.conflicts.increment(1);
                    }
                    if attempt >= max_attempts {
                        warn!(name = %name, attempts = attempt, ?field, "Giving up after repeated conflicts");
                        return Err(OperatorError::Conflict {
                            kind,
                            name,
                            attempts: attempt,
                        });
                    }
                    debug!(name = %name, attempt, ?field, "Write conflict, re-fetching");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_correction(&self, field: DriftField) {
        if let Some(ref metrics) = self.metrics {
            match field {
                DriftField::Replicas => metrics.replica_corrections.increment(1),
                DriftField::Requests => metrics.request_corrections.increment(1),
            }
        }
    }
}
