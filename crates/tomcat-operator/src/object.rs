//! Typed and generic object representations
//!
//! Rendered manifests arrive either as typed `k8s_openapi` structs or as
//! schema-less JSON trees. The transformer works on typed values; server-side
//! apply works on generic ones. This module converts between the two without
//! losing fields in either direction.

use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema-less key/value tree form of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericObject(Map<String, Value>);

impl GenericObject {
    /// Wrap a JSON value; it must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(OperatorError::conversion(
                "unknown",
                format!("expected a JSON object, got {}", json_type(&other)),
            )),
        }
    }

    /// The `apiVersion` field, if present
    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    /// The `kind` field, if present
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    /// The `metadata.name` field, if present
    pub fn name(&self) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
    }

    /// Group/version/kind parsed from `apiVersion` and `kind`
    pub fn gvk(&self) -> Result<GroupVersionKind> {
        let (api_version, kind) = self.api_version().zip(self.kind()).ok_or_else(|| {
            OperatorError::conversion(
                self.kind().unwrap_or("unknown"),
                "object is missing apiVersion or kind",
            )
        })?;
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        Ok(GroupVersionKind::gvk(group, version, kind))
    }

    /// Borrow the underlying tree
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a `DynamicObject` for the generic apply machinery
    pub fn into_dynamic(self) -> Result<DynamicObject> {
        let kind = self.kind().unwrap_or("unknown").to_string();
        serde_json::from_value(Value::Object(self.0))
            .map_err(|e| OperatorError::conversion(kind, e.to_string()))
    }
}

/// Convert a typed object into its generic form
pub fn to_generic<K>(object: &K) -> Result<GenericObject>
where
    K: k8s_openapi::Resource + Serialize,
{
    let value = serde_json::to_value(object)
        .map_err(|e| OperatorError::conversion(K::KIND, e.to_string()))?;
    GenericObject::from_value(value).map_err(|e| match e {
        OperatorError::Conversion { message, .. } => OperatorError::conversion(K::KIND, message),
        other => other,
    })
}

/// Convert a generic object into the typed form `K`
///
/// Fails if the tree's `apiVersion`/`kind` is not `K`'s.
pub fn from_generic<K>(object: &GenericObject) -> Result<K>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    if object.api_version() != Some(K::API_VERSION) || object.kind() != Some(K::KIND) {
        return Err(OperatorError::conversion(
            K::KIND,
            format!(
                "expected {}/{}, found {}/{}",
                K::API_VERSION,
                K::KIND,
                object.api_version().unwrap_or("<none>"),
                object.kind().unwrap_or("<none>")
            ),
        ));
    }
    serde_json::from_value(Value::Object(object.0.clone()))
        .map_err(|e| OperatorError::conversion(K::KIND, e.to_string()))
}

/// Kinds the transformer has correction rules for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// `apps/v1` Deployment
    Workload,
    /// `v1` Service
    NetworkEndpoint,
}

impl ObjectKind {
    /// Look up a kind by its `apiVersion` and `kind`
    pub fn from_type(api_version: &str, kind: &str) -> Option<Self> {
        use k8s_openapi::Resource;

        if api_version == Deployment::API_VERSION && kind == Deployment::KIND {
            Some(ObjectKind::Workload)
        } else if api_version == Service::API_VERSION && kind == Service::KIND {
            Some(ObjectKind::NetworkEndpoint)
        } else {
            None
        }
    }
}

/// One object produced by the manifest renderer
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedObject {
    Deployment(Box<Deployment>),
    Service(Box<Service>),
    Generic(GenericObject),
}

impl RenderedObject {
    /// `apiVersion` of the object
    pub fn api_version(&self) -> Option<&str> {
        use k8s_openapi::Resource;

        match self {
            RenderedObject::Deployment(_) => Some(Deployment::API_VERSION),
            RenderedObject::Service(_) => Some(Service::API_VERSION),
            RenderedObject::Generic(g) => g.api_version(),
        }
    }

    /// `kind` of the object
    pub fn kind(&self) -> Option<&str> {
        use k8s_openapi::Resource;

        match self {
            RenderedObject::Deployment(_) => Some(Deployment::KIND),
            RenderedObject::Service(_) => Some(Service::KIND),
            RenderedObject::Generic(g) => g.kind(),
        }
    }

    /// The kind's rule-table key, if the kind is recognized
    pub fn object_kind(&self) -> Option<ObjectKind> {
        ObjectKind::from_type(self.api_version()?, self.kind()?)
    }

    /// Convert to generic form, whatever the current representation
    pub fn into_generic(self) -> Result<GenericObject> {
        match self {
            RenderedObject::Deployment(d) => to_generic(d.as_ref()),
            RenderedObject::Service(s) => to_generic(s.as_ref()),
            RenderedObject::Generic(g) => Ok(g),
        }
    }
}

impl From<Deployment> for RenderedObject {
    fn from(deployment: Deployment) -> Self {
        RenderedObject::Deployment(Box::new(deployment))
    }
}

impl From<Service> for RenderedObject {
    fn from(service: Service) -> Self {
        RenderedObject::Service(Box::new(service))
    }
}

impl From<GenericObject> for RenderedObject {
    fn from(object: GenericObject) -> Self {
        RenderedObject::Generic(object)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
