//! Service Catalog
//!
//! Static description of the offered services and their plans. The catalog
//! is assembled from the registered strategies, so it only ever lists
//! services the broker can actually provision.

use serde::{Deserialize, Serialize};

use crate::types::ServiceType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plans: Vec<ServicePlan>,
    /// Internal dispatch key, not part of the wire format
    #[serde(skip)]
    pub service_type: Option<ServiceType>,
}

impl Service {
    /// Create a bindable service with a single free "default" plan
    pub fn with_default_plan(
        service_type: ServiceType,
        id: &str,
        name: &str,
        description: &str,
        plan_id: &str,
        plan_description: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            bindable: true,
            plans: vec![ServicePlan {
                id: plan_id.to_string(),
                name: "default".to_string(),
                description: plan_description.to_string(),
                free: true,
            }],
            service_type: Some(service_type),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub services: Vec<Service>,
}

impl Catalog {
    /// Resolve a request's `service_id` to a service type.
    ///
    /// Accepts either the catalog id or the service-type slug.
    pub fn resolve(&self, service_id: &str) -> Option<ServiceType> {
        self.services
            .iter()
            .find(|s| s.id == service_id)
            .and_then(|s| s.service_type)
            .or_else(|| ServiceType::from_slug(service_id))
    }
}
