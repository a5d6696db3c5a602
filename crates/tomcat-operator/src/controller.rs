//! Tomcat Controller
//!
//! This module implements the Kubernetes controller pattern for managing
//! Tomcat custom resources. Each pass renders the instance's manifests,
//! runs them through the correction rules, applies them and then repairs
//! drift on the live workload before reporting status.

use crate::crd::{workload_name, Tomcat, TomcatCondition, TomcatPhase, TomcatStatus};
use crate::drift::{DriftConfig, DriftMetrics, DriftReconciler, KubeWorkloadClient, SyncOutcome};
use crate::error::{OperatorError, Result};
use crate::object::GenericObject;
use crate::resources::{ManifestRenderer, RendererConfig, TomcatRenderer};
use crate::transformer::{ManifestTransformer, TransformConfig};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "tomcat-operator";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Settings for every stage of a reconcile pass
#[derive(Debug, Clone, Default)]
pub struct OperatorConfig {
    pub transform: TransformConfig,
    pub drift: DriftConfig,
    pub renderer: RendererConfig,
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Produces the baseline manifests
    pub renderer: Box<dyn ManifestRenderer>,
    /// Applies correction rules to rendered manifests
    pub transformer: ManifestTransformer,
    /// Repairs drift on the live workload
    pub drift: DriftReconciler<KubeWorkloadClient>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-instance error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("tomcat_operator_reconciliations_total"),
            errors: metrics::counter!("tomcat_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("tomcat_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerContext {
    /// Build a context with the built-in renderer
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let drift = DriftReconciler::new(KubeWorkloadClient::new(client.clone()), config.drift)
            .with_metrics(DriftMetrics::new());

        Self {
            client,
            renderer: Box::new(TomcatRenderer::new(config.renderer)),
            transformer: ManifestTransformer::new(config.transform),
            drift,
            metrics: Some(ControllerMetrics::new()),
            error_counts: dashmap::DashMap::new(),
        }
    }
}

/// Start the Tomcat controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
) -> Result<()> {
    let tomcats: Api<Tomcat> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext::new(client.clone(), config));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting Tomcat controller"
    );

    // Watch related resources for changes
    let deployments = match &namespace {
        Some(ns) => Api::<Deployment>::namespaced(client.clone(), ns),
        None => Api::<Deployment>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    Controller::new(tomcats, Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(tomcat, ctx), fields(name = %tomcat.name_any(), namespace = tomcat.namespace()))]
async fn reconcile(tomcat: Arc<Tomcat>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = tomcat.name_any();
    let result = apply_tomcat(&tomcat, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(action) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&key);
            Ok(action)
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Render, correct and apply the instance's objects, then repair drift
async fn apply_tomcat(tomcat: &Tomcat, ctx: &ControllerContext) -> Result<Action> {
    let name = tomcat.name_any();
    let namespace = tomcat.namespace().unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Reconciling Tomcat");

    if let Err(errors) = tomcat.spec.validate() {
        let error_msg = validation_messages(&errors).join("; ");
        warn!(name = %name, errors = %error_msg, "Tomcat spec validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    let rendered = ctx.renderer.render(tomcat)?;
    let objects = ctx.transformer.transform(&namespace, &name, rendered)?;

    for object in objects {
        let generic = object.into_generic()?;
        apply_object(&ctx.client, &namespace, generic).await?;
    }

    let mut corrected = Vec::new();
    if ctx.drift.sync_resource_requests(tomcat).await? == SyncOutcome::Updated {
        corrected.push("resources.requests");
    }
    if ctx.drift.sync_replicas(tomcat).await? == SyncOutcome::Updated {
        corrected.push("replicas");
    }

    let workload = workload_name(&name, &ctx.drift.config().workload_suffix);
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let deployment_status = deployments.get_opt(&workload).await?.and_then(|d| d.status);

    let status = build_status(tomcat, deployment_status, &corrected);
    update_status(&ctx.client, &namespace, &name, status).await?;

    info!(name = %name, "Reconciliation complete");

    Ok(Action::requeue(Duration::from_secs(
        DEFAULT_REQUEUE_SECONDS,
    )))
}

/// Flatten nested validation errors into `path: message` strings
fn validation_messages(errors: &ValidationErrors) -> Vec<String> {
    fn collect(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
        for (field, kind) in errors.errors() {
            let path = if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{}.{}", prefix, field)
            };
            match kind {
                ValidationErrorsKind::Field(errs) => out.extend(errs.iter().map(|e| {
                    format!("{}: {}", path, e.message.as_deref().unwrap_or(e.code.as_ref()))
                })),
                ValidationErrorsKind::Struct(inner) => collect(&path, inner, out),
                ValidationErrorsKind::List(items) => {
                    for (i, inner) in items {
                        collect(&format!("{}[{}]", path, i), inner, out);
                    }
                }
            }
        }
    }

    let mut out = Vec::new();
    collect("", errors, &mut out);
    out.sort();
    out
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource whose `app.kubernetes.io/managed-by` label names another
/// manager (Helm, another operator) is rejected. Unlabelled resources and
/// resources that do not exist yet are accepted.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply one object of any kind using server-side apply.
///
/// Uses `PatchParams::apply(FIELD_MANAGER).force()`, which takes ownership
/// of every field in the patch, so ownership is checked first.
async fn apply_object(client: &Client, namespace: &str, object: GenericObject) -> Result<()> {
    let gvk = object.gvk()?;
    let resource = ApiResource::from_gvk(&gvk);
    let dynamic = object.into_dynamic()?;
    let name = dynamic.metadata.name.clone().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", gvk.kind))
    })?;

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    debug!(kind = %gvk.kind, name = %name, "Applying object");

    // Verify ownership before force-applying
    if let Ok(existing) = api.get(&name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &patch_params, &Patch::Apply(&dynamic))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Build instance status from the Deployment status
fn build_status(
    tomcat: &Tomcat,
    deployment_status: Option<DeploymentStatus>,
    corrected: &[&str],
) -> TomcatStatus {
    let now = Utc::now().to_rfc3339();

    let (replicas, ready_replicas, updated_replicas) = deployment_status
        .map(|s| {
            (
                s.replicas.unwrap_or(0),
                s.ready_replicas.unwrap_or(0),
                s.updated_replicas.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0, 0));

    let desired_replicas = tomcat.spec.replicas;

    // Determine phase based on state
    let phase = if ready_replicas == 0 {
        TomcatPhase::Provisioning
    } else if ready_replicas < desired_replicas {
        if updated_replicas < desired_replicas {
            TomcatPhase::Updating
        } else {
            TomcatPhase::Degraded
        }
    } else if ready_replicas == desired_replicas {
        TomcatPhase::Running
    } else {
        TomcatPhase::Degraded
    };

    let condition = |condition_type: &str, ok: bool, reason: String| TomcatCondition {
        condition_type: condition_type.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: Some(reason),
        message: None,
        last_transition_time: Some(now.clone()),
    };

    let conditions = vec![
        condition(
            "Ready",
            ready_replicas >= desired_replicas,
            format!("{}/{} replicas ready", ready_replicas, desired_replicas),
        ),
        condition(
            "Available",
            ready_replicas > 0,
            if ready_replicas > 0 {
                "AtLeastOneReplicaReady"
            } else {
                "NoReplicasReady"
            }
            .to_string(),
        ),
    ];

    let message = (!corrected.is_empty()).then(|| format!("Corrected drift in {}", corrected.join(", ")));

    TomcatStatus {
        phase,
        replicas,
        ready_replicas,
        updated_replicas,
        observed_generation: tomcat.metadata.generation.unwrap_or(0),
        conditions,
        last_updated: Some(now),
        message,
    }
}

/// Update the instance status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: TomcatStatus,
) -> Result<()> {
    let api: Api<Tomcat> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, phase = ?status.phase, "Updating Tomcat status");

    let patch = serde_json::json!({
        "status": status
    });

    let patch_params = PatchParams::default();
    api.patch_status(name, &patch_params, &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Backoff delay for the given retry count and error
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    // Use the error's suggested delay OR exponential backoff:
    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

/// Error policy for the controller with exponential backoff
fn error_policy(tomcat: Arc<Tomcat>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = tomcat.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
