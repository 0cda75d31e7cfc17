//! Service Broker Types
//!
//! Instances, backing resource references and the Open Service Broker
//! request/response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consumable credentials handed out to callers
pub type Credential = BTreeMap<String, String>;

/// Service definition an instance was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// No-op service whose credential is supplied by the caller
    UserProvided,
    /// Database workload running as a pod in the caller's namespace
    DatabasePod,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::UserProvided => "user-provided",
            ServiceType::DatabasePod => "database-pod",
        }
    }

    /// Parse a service-type slug (e.g. "database-pod")
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "user-provided" => Some(ServiceType::UserProvided),
            "database-pod" => Some(ServiceType::DatabasePod),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of cluster object backing an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Secret,
    Workload,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Secret => write!(f, "secret"),
            ResourceKind::Workload => write!(f, "workload"),
        }
    }
}

/// Reference to one object created by the resource provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Everything created for a provisioning-based instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackingResources {
    pub secret: ResourceRef,
    pub workload: ResourceRef,
}

/// Network address of a running workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadAddress {
    pub host: String,
    pub port: i32,
}

/// One provisioned instance of a service type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub service_type: ServiceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Namespace supplied in the request context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing: Option<BackingResources>,
    pub created_at: DateTime<Utc>,
}

/// Platform context sent alongside broker requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Body of `PUT /v2/service_instances/:instance_id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateServiceInstanceRequest {
    /// Catalog service id or service-type slug
    pub service_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub context: RequestContext,
}

impl CreateServiceInstanceRequest {
    /// Namespace the instance should be placed in, if any was given
    pub fn location(&self) -> Option<&str> {
        self.context
            .namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateServiceInstanceResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteServiceInstanceResponse {}

/// Body of `PUT .../service_bindings/:binding_id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingRequest {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceBindingResponse {
    pub credentials: Credential,
}
