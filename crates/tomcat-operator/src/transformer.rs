//! Manifest Transformer
//!
//! Runs the correction rules over the objects rendered for one Tomcat
//! instance before they are applied. Rules are looked up in a [`RuleTable`]
//! keyed by [`ObjectKind`]; objects of any other kind pass through untouched.
//! Every object that went through a rule chain comes out in generic form.

use crate::error::{OperatorError, Result};
use crate::object::{from_generic, to_generic, GenericObject, ObjectKind, RenderedObject};
use crate::quantity::CanonicalQuantity;
use crate::rules::{self, Rule};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

/// Default CPU limit for containers that declare none
const DEFAULT_CPU_LIMIT: &str = "123m";

/// Default memory limit for containers that declare none
const DEFAULT_MEMORY_LIMIT: &str = "122Mi";

/// Default weight of the preferred anti-affinity term
const DEFAULT_ANTI_AFFINITY_WEIGHT: i32 = 100;

/// Default topology key: one replica per host
const DEFAULT_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Values the correction rules fill in
#[derive(Debug, Clone, PartialEq)]
pub struct TransformConfig {
    /// CPU limit for containers without one
    pub default_cpu_limit: String,
    /// Memory limit for containers without one
    pub default_memory_limit: String,
    /// Weight of the preferred anti-affinity term (1-100)
    pub anti_affinity_weight: i32,
    /// Topology key of the anti-affinity term
    pub topology_key: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            default_cpu_limit: DEFAULT_CPU_LIMIT.to_string(),
            default_memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            anti_affinity_weight: DEFAULT_ANTI_AFFINITY_WEIGHT,
            topology_key: DEFAULT_TOPOLOGY_KEY.to_string(),
        }
    }
}

impl TransformConfig {
    /// Check the configured values before the transformer is built
    pub fn validate(&self) -> Result<()> {
        CanonicalQuantity::parse(&self.default_cpu_limit).map_err(|e| {
            OperatorError::InvalidConfig(format!("default CPU limit: {}", e))
        })?;
        CanonicalQuantity::parse(&self.default_memory_limit).map_err(|e| {
            OperatorError::InvalidConfig(format!("default memory limit: {}", e))
        })?;
        if !(1..=100).contains(&self.anti_affinity_weight) {
            return Err(OperatorError::InvalidConfig(format!(
                "anti-affinity weight must be between 1 and 100, got {}",
                self.anti_affinity_weight
            )));
        }
        if self.topology_key.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "topology key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rule chains per object kind, applied in order
#[derive(Debug, Clone)]
pub struct RuleTable {
    /// Rules for `ObjectKind::Workload`
    pub workload: Vec<Rule<Deployment>>,
    /// Rules for `ObjectKind::NetworkEndpoint`
    pub network_endpoint: Vec<Rule<Service>>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            workload: vec![rules::POD_ANTI_AFFINITY, rules::DEFAULT_RESOURCE_LIMITS],
            network_endpoint: vec![rules::HEADLESS_SERVICE],
        }
    }
}

/// Applies the correction rules to rendered objects
#[derive(Debug, Clone, Default)]
pub struct ManifestTransformer {
    config: TransformConfig,
    rules: RuleTable,
}

impl ManifestTransformer {
    /// Create a transformer with the default rule table
    pub fn new(config: TransformConfig) -> Self {
        Self {
            config,
            rules: RuleTable::default(),
        }
    }

    /// Create a transformer with a custom rule table
    pub fn with_rules(config: TransformConfig, rules: RuleTable) -> Self {
        Self { config, rules }
    }

    /// The configuration the rules run with
    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Transform all objects rendered for one instance.
    ///
    /// Output has the same length and order as the input. Either every object
    /// is transformed or an error is returned.
    ///
    /// Generic Deployments and Services are decoded into their `k8s_openapi`
    /// types before the rules run, so fields that schema does not model are
    /// dropped from them. Objects of other kinds keep every field.
    pub fn transform(
        &self,
        namespace: &str,
        name: &str,
        objects: Vec<RenderedObject>,
    ) -> Result<Vec<RenderedObject>> {
        debug!(
            namespace = %namespace,
            name = %name,
            objects = objects.len(),
            "Transforming rendered objects"
        );

        objects
            .into_iter()
            .map(|object| self.transform_object(object))
            .collect()
    }

    fn transform_object(&self, object: RenderedObject) -> Result<RenderedObject> {
        let generic = match object {
            RenderedObject::Deployment(deployment) => {
                self.correct(*deployment, &self.rules.workload)?
            }
            RenderedObject::Service(service) => {
                self.correct(*service, &self.rules.network_endpoint)?
            }
            RenderedObject::Generic(generic) => {
                let kind = generic
                    .api_version()
                    .zip(generic.kind())
                    .and_then(|(api_version, kind)| ObjectKind::from_type(api_version, kind));
                match kind {
                    Some(ObjectKind::Workload) => self.correct(
                        from_generic::<Deployment>(&generic)?,
                        &self.rules.workload,
                    )?,
                    Some(ObjectKind::NetworkEndpoint) => self.correct(
                        from_generic::<Service>(&generic)?,
                        &self.rules.network_endpoint,
                    )?,
                    None => return Ok(RenderedObject::Generic(generic)),
                }
            }
        };
        Ok(RenderedObject::Generic(generic))
    }

    fn correct<K>(&self, mut object: K, chain: &[Rule<K>]) -> Result<GenericObject>
    where
        K: k8s_openapi::Resource + Serialize + DeserializeOwned,
    {
        for rule in chain {
            trace!(rule = rule.name, kind = K::KIND, "Applying correction rule");
            (rule.apply)(&mut object, &self.config);
        }
        to_generic(&object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{
        Container, PodSpec, PodTemplateSpec, ResourceRequirements, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn deployment(cpu_limit: Option<&str>) -> Deployment {
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        Deployment {
            metadata: ObjectMeta {
                name: Some("web-tomcat".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "tomcat".to_string(),
                            resources: cpu_limit.map(|cpu| ResourceRequirements {
                                limits: Some(BTreeMap::from([(
                                    "cpu".to_string(),
                                    Quantity(cpu.to_string()),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web-tomcat".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_map() -> GenericObject {
        GenericObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "web-config" },
            "data": { "server.xml": "<Server/>" }
        }))
        .unwrap()
    }

    fn rendered() -> Vec<RenderedObject> {
        vec![
            RenderedObject::from(config_map()),
            RenderedObject::from(deployment(None)),
            RenderedObject::from(service()),
        ]
    }

    fn transform(objects: Vec<RenderedObject>) -> Vec<RenderedObject> {
        ManifestTransformer::default()
            .transform("default", "web", objects)
            .unwrap()
    }

    #[test]
    fn test_empty_input() {
        assert!(transform(vec![]).is_empty());
    }

    #[test]
    fn test_preserves_order_and_kinds() {
        let input = rendered();
        let kinds: Vec<_> = input.iter().map(|o| o.kind().map(str::to_string)).collect();

        let output = transform(input);

        assert_eq!(output.len(), 3);
        let out_kinds: Vec<_> = output.iter().map(|o| o.kind().map(str::to_string)).collect();
        assert_eq!(kinds, out_kinds);
    }

    #[test]
    fn test_recognized_kinds_come_out_generic() {
        let output = transform(rendered());
        assert!(output
            .iter()
            .all(|o| matches!(o, RenderedObject::Generic(_))));
    }

    #[test]
    fn test_unrecognized_kind_untouched() {
        let output = transform(rendered());
        assert_eq!(output[0], RenderedObject::Generic(config_map()));
    }

    #[test]
    fn test_rules_applied() {
        let output = transform(rendered());

        let RenderedObject::Generic(ref deployment) = output[1] else {
            panic!("expected generic deployment");
        };
        let deployment: Deployment = from_generic(deployment).unwrap();
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.affinity.unwrap().pod_anti_affinity.is_some());
        let limits = pod_spec.containers[0]
            .resources
            .clone()
            .unwrap()
            .limits
            .unwrap();
        assert_eq!(limits["cpu"], Quantity("123m".to_string()));

        let RenderedObject::Generic(ref service) = output[2] else {
            panic!("expected generic service");
        };
        let service: Service = from_generic(service).unwrap();
        assert_eq!(service.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn test_generic_input_is_corrected() {
        let generic = to_generic(&deployment(None)).unwrap();
        let typed_output = transform(vec![RenderedObject::from(deployment(None))]);
        let generic_output = transform(vec![RenderedObject::Generic(generic)]);
        assert_eq!(typed_output, generic_output);
    }

    #[test]
    fn test_unmodelled_fields_dropped_from_recognized_kinds() {
        let mut value = serde_json::to_value(deployment(None)).unwrap();
        value["spec"]["legacyField"] = json!("kept?");
        let generic = GenericObject::from_value(value).unwrap();

        let output = transform(vec![RenderedObject::Generic(generic)]);

        let RenderedObject::Generic(ref corrected) = output[0] else {
            panic!("expected generic deployment");
        };
        let spec = corrected.as_map()["spec"].as_object().unwrap();
        assert!(!spec.contains_key("legacyField"));
        assert!(spec.contains_key("template"));

        let mut cm = serde_json::to_value(config_map()).unwrap();
        cm["legacyField"] = json!("kept");
        let cm = GenericObject::from_value(cm).unwrap();
        let output = transform(vec![RenderedObject::Generic(cm.clone())]);
        assert_eq!(output[0], RenderedObject::Generic(cm));
    }

    #[test]
    fn test_idempotent() {
        let once = transform(rendered());
        let twice = transform(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_explicit_limit_preserved() {
        let output = transform(vec![RenderedObject::from(deployment(Some("750m")))]);
        let RenderedObject::Generic(ref generic) = output[0] else {
            panic!("expected generic deployment");
        };
        assert_eq!(
            generic.as_map()["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]
                ["cpu"],
            json!("750m")
        );
    }

    #[test]
    fn test_malformed_generic_deployment_fails_whole_pass() {
        let broken = GenericObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "broken" },
            "spec": { "replicas": "many" }
        }))
        .unwrap();

        let result = ManifestTransformer::default().transform(
            "default",
            "web",
            vec![RenderedObject::from(service()), RenderedObject::Generic(broken)],
        );
        assert!(matches!(result, Err(OperatorError::Conversion { .. })));
    }

    #[test]
    fn test_custom_rule_table() {
        let table = RuleTable {
            workload: vec![rules::DEFAULT_RESOURCE_LIMITS],
            network_endpoint: vec![],
        };
        let transformer = ManifestTransformer::with_rules(TransformConfig::default(), table);
        let output = transformer
            .transform("default", "web", vec![RenderedObject::from(service())])
            .unwrap();
        assert_eq!(
            output[0],
            RenderedObject::Generic(to_generic(&service()).unwrap())
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(TransformConfig::default().validate().is_ok());

        let bad_cpu = TransformConfig {
            default_cpu_limit: "lots".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            bad_cpu.validate(),
            Err(OperatorError::InvalidConfig(_))
        ));

        let bad_weight = TransformConfig {
            anti_affinity_weight: 0,
            ..Default::default()
        };
        assert!(bad_weight.validate().is_err());
    }
}
