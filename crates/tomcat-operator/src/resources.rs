//! Kubernetes Resource Builders
//!
//! This module produces the baseline manifests (Deployment, Service) for a
//! Tomcat resource. It sits behind the [`ManifestRenderer`] trait so the
//! controller does not care whether objects come from here or from a chart
//! engine.

use crate::crd::{workload_name, Tomcat, DEFAULT_WORKLOAD_SUFFIX};
use crate::error::{OperatorError, Result};
use crate::object::RenderedObject;
use crate::rules::{RESOURCE_CPU, RESOURCE_MEMORY};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;

/// Port Tomcat's HTTP connector listens on
const TOMCAT_HTTP_PORT: i32 = 8080;

/// Port exposed by the service
const SERVICE_HTTP_PORT: i32 = 80;

/// Produces the objects to apply for one Tomcat instance
pub trait ManifestRenderer: Send + Sync {
    /// Render all objects for the instance. An empty list is valid.
    fn render(&self, tomcat: &Tomcat) -> Result<Vec<RenderedObject>>;
}

/// Settings for the built-in renderer
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Image repository; `spec.version` is the tag
    pub image_repository: String,
    /// Suffix of the Deployment and Service names
    pub workload_suffix: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            image_repository: "tomcat".to_string(),
            workload_suffix: DEFAULT_WORKLOAD_SUFFIX.to_string(),
        }
    }
}

/// Renders a Deployment and a ClusterIP Service per instance
#[derive(Debug, Clone, Default)]
pub struct TomcatRenderer {
    config: RendererConfig,
}

impl TomcatRenderer {
    /// Create a renderer
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }
}

impl ManifestRenderer for TomcatRenderer {
    fn render(&self, tomcat: &Tomcat) -> Result<Vec<RenderedObject>> {
        let builder = ResourceBuilder::new(tomcat, &self.config)?;
        Ok(vec![
            RenderedObject::from(builder.build_deployment()),
            RenderedObject::from(builder.build_service()),
        ])
    }
}

/// Builder for generating Kubernetes resources from a Tomcat resource
pub struct ResourceBuilder<'a> {
    tomcat: &'a Tomcat,
    config: &'a RendererConfig,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(tomcat: &'a Tomcat, config: &'a RendererConfig) -> Result<Self> {
        let name = tomcat
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("Tomcat name is required".to_string()))?;

        let namespace = tomcat
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            tomcat,
            config,
            name,
            namespace,
        })
    }

    /// Get the name shared by the Deployment and Service
    fn resource_name(&self) -> String {
        workload_name(&self.name, &self.config.workload_suffix)
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Tomcat::api_version(&()).to_string(),
            kind: Tomcat::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.tomcat.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.resource_name()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.tomcat.spec.get_labels(&self.name)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the Deployment running Tomcat
    pub fn build_deployment(&self) -> Deployment {
        let spec = &self.tomcat.spec;
        let selector_labels = spec.get_selector_labels(&self.name);

        let pod_spec = PodSpec {
            containers: vec![self.build_container()],
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Tomcat container
    fn build_container(&self) -> Container {
        let spec = &self.tomcat.spec;

        let requests = BTreeMap::from([
            (
                RESOURCE_CPU.to_string(),
                Quantity(spec.resources.requests.cpu.clone()),
            ),
            (
                RESOURCE_MEMORY.to_string(),
                Quantity(spec.resources.requests.memory.clone()),
            ),
        ]);

        let probe = |initial_delay_seconds| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::String("http".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay_seconds),
            period_seconds: Some(10),
            ..Default::default()
        };

        Container {
            name: "tomcat".to_string(),
            image: Some(format!("{}:{}", self.config.image_repository, spec.version)),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: TOMCAT_HTTP_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            liveness_probe: Some(probe(30)),
            readiness_probe: Some(probe(10)),
            ..Default::default()
        }
    }

    /// Build the Service in front of the Deployment
    pub fn build_service(&self) -> Service {
        let selector_labels = self.tomcat.spec.get_selector_labels(&self.name);

        Service {
            metadata: self.metadata(),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: SERVICE_HTTP_PORT,
                    target_port: Some(IntOrString::String("http".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{TomcatRequests, TomcatResources, TomcatSpec};

    fn create_test_tomcat(name: &str) -> Tomcat {
        let mut tomcat = Tomcat::new(
            name,
            TomcatSpec {
                version: "10.1".to_string(),
                replicas: 3,
                resources: TomcatResources {
                    requests: TomcatRequests {
                        cpu: "250m".to_string(),
                        memory: "512Mi".to_string(),
                    },
                },
            },
        );
        tomcat.metadata.namespace = Some("web".to_string());
        tomcat.metadata.uid = Some("test-uid-123".to_string());
        tomcat
    }

    #[test]
    fn test_build_deployment() {
        let tomcat = create_test_tomcat("shop");
        let config = RendererConfig::default();
        let builder = ResourceBuilder::new(&tomcat, &config).unwrap();
        let deployment = builder.build_deployment();

        assert_eq!(deployment.metadata.name, Some("shop-tomcat".to_string()));
        assert_eq!(deployment.metadata.namespace, Some("web".to_string()));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("tomcat:10.1"));
        let requests = container
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests["cpu"], Quantity("250m".to_string()));
        assert_eq!(requests["memory"], Quantity("512Mi".to_string()));
    }

    #[test]
    fn test_selector_matches_pod_labels() {
        let tomcat = create_test_tomcat("shop");
        let config = RendererConfig::default();
        let deployment = ResourceBuilder::new(&tomcat, &config)
            .unwrap()
            .build_deployment();

        let spec = deployment.spec.unwrap();
        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.unwrap().labels
        );
    }

    #[test]
    fn test_build_service() {
        let tomcat = create_test_tomcat("shop");
        let config = RendererConfig::default();
        let svc = ResourceBuilder::new(&tomcat, &config)
            .unwrap()
            .build_service();

        assert_eq!(svc.metadata.name, Some("shop-tomcat".to_string()));
        assert_eq!(
            svc.spec.as_ref().unwrap().type_,
            Some("ClusterIP".to_string())
        );
    }

    #[test]
    fn test_owner_references() {
        let tomcat = create_test_tomcat("shop");
        let config = RendererConfig::default();
        let deployment = ResourceBuilder::new(&tomcat, &config)
            .unwrap()
            .build_deployment();

        let owner_refs = deployment.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "Tomcat");
        assert_eq!(owner_refs[0].api_version, "tomcat.opencanon.com/v1");
        assert_eq!(owner_refs[0].uid, "test-uid-123");
    }

    #[test]
    fn test_custom_image_and_suffix() {
        let tomcat = create_test_tomcat("shop");
        let config = RendererConfig {
            image_repository: "registry.local/tomcat".to_string(),
            workload_suffix: "-app".to_string(),
        };
        let objects = TomcatRenderer::new(config).render(&tomcat).unwrap();

        assert_eq!(objects.len(), 2);
        let RenderedObject::Deployment(ref deployment) = objects[0] else {
            panic!("expected a Deployment first");
        };
        assert_eq!(deployment.metadata.name.as_deref(), Some("shop-app"));
        let image = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
            [0]
        .image
        .clone();
        assert_eq!(image.as_deref(), Some("registry.local/tomcat:10.1"));
        assert!(matches!(objects[1], RenderedObject::Service(_)));
    }

    #[test]
    fn test_missing_name_rejected() {
        let mut tomcat = create_test_tomcat("shop");
        tomcat.metadata.name = None;
        let config = RendererConfig::default();
        assert!(matches!(
            ResourceBuilder::new(&tomcat, &config),
            Err(OperatorError::InvalidConfig(_))
        ));
    }
}
