//! # Tomcat Kubernetes Operator
//!
//! Kubernetes operator for `Tomcat` custom resources. It renders a
//! Deployment and a Service per instance, corrects the rendered manifests
//! before they are applied, and repairs drift on the live workload
//! afterwards.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tomcat_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Every reconcile pass goes through the same stages:
//!
//! 1. **Render**: [`resources::ManifestRenderer`] produces typed or generic objects
//! 2. **Correct**: [`transformer::ManifestTransformer`] runs the per-kind
//!    [`rules`] (pod anti-affinity and default limits on Deployments,
//!    headless coercion on Services) and hands back generic objects
//! 3. **Apply**: each object is server-side applied
//! 4. **Repair**: [`drift::DriftReconciler`] re-reads the live Deployment and
//!    rewrites replicas and resource requests that diverge from the resource
//! 5. **Status**: replica counts and conditions are written to the resource
//!
//! ## Modules
//!
//! - [`crd`] - `Tomcat` custom resource with validation
//! - [`object`] - conversion between typed and generic objects
//! - [`quantity`] - Kubernetes quantity parsing and comparison
//! - [`rules`] - correction rules
//! - [`transformer`] - rule dispatch over rendered manifests
//! - [`drift`] - live workload drift correction
//! - [`resources`] - built-in manifest renderer
//! - [`controller`] - reconciliation loop
//! - [`error`] - error types
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: tomcat.opencanon.com/v1
//! kind: Tomcat
//! metadata:
//!   name: shop
//! spec:
//!   version: "10.1"
//!   replicas: 3
//!   resources:
//!     requests:
//!       cpu: 250m
//!       memory: 512Mi
//! ```
//!
//! ## Metrics
//!
//! - `tomcat_operator_reconciliations_total` - Total reconciliation attempts
//! - `tomcat_operator_reconciliation_errors_total` - Reconciliation errors
//! - `tomcat_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `tomcat_operator_drift_corrections_total` - Live workload rewrites, by field
//! - `tomcat_operator_update_conflicts_total` - Conditional writes that lost a race

pub mod controller;
pub mod crd;
pub mod drift;
pub mod error;
pub mod object;
pub mod quantity;
pub mod resources;
pub mod rules;
pub mod transformer;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, OperatorConfig,
    };
    pub use crate::crd::{
        Tomcat, TomcatCondition, TomcatPhase, TomcatRequests, TomcatResources, TomcatSpec,
        TomcatStatus,
    };
    pub use crate::drift::{
        DriftConfig, DriftMetrics, DriftReconciler, KubeWorkloadClient, SyncOutcome,
        WorkloadClient,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::object::{from_generic, to_generic, GenericObject, ObjectKind, RenderedObject};
    pub use crate::quantity::CanonicalQuantity;
    pub use crate::resources::{ManifestRenderer, RendererConfig, ResourceBuilder, TomcatRenderer};
    pub use crate::rules::Rule;
    pub use crate::transformer::{ManifestTransformer, RuleTable, TransformConfig};
}
