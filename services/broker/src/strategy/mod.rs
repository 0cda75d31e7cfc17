//! Service Strategies
//!
//! One strategy per service type. Each carries its catalog entry and the
//! provision / deprovision / bind / unbind capability set; adding a service
//! type means registering another strategy with the [`StrategyTable`].

mod database_pod;
mod user_provided;

pub use database_pod::DatabasePodStrategy;
pub use user_provided::{placeholder_credential, UserProvidedStrategy};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{Catalog, Service};
use crate::error::Result;
use crate::types::{BackingResources, Credential, ServiceInstance, ServiceType};

/// Input to a provisioning run
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub instance_id: &'a str,
    /// Namespace from the request context, already trimmed
    pub location: Option<&'a str>,
    pub parameters: &'a serde_json::Map<String, serde_json::Value>,
}

/// What a successful provisioning run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Provisioned {
    pub credential: Option<Credential>,
    pub backing: Option<BackingResources>,
}

/// Credential issued by a bind
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub credential: Credential,
    /// Whether the credential must be stored on the instance
    pub persist: bool,
}

/// Per-service-type lifecycle logic
#[async_trait]
pub trait ServiceStrategy: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Static catalog description of this service
    fn catalog_entry(&self) -> Service;

    /// Create everything the instance needs. On error nothing may be left behind.
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<Provisioned>;

    /// Release everything the instance owns. Already absent resources count as released.
    async fn deprovision(&self, instance: &ServiceInstance) -> Result<()>;

    async fn bind(&self, instance: &ServiceInstance, binding_id: &str) -> Result<Binding>;

    async fn unbind(&self, instance: &ServiceInstance, binding_id: &str) -> Result<()>;
}

/// Registered strategies, in registration order
#[derive(Default, Clone)]
pub struct StrategyTable {
    order: Vec<ServiceType>,
    strategies: HashMap<ServiceType, Arc<dyn ServiceStrategy>>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy, replacing any previous one for the same service type
    pub fn register(mut self, strategy: Arc<dyn ServiceStrategy>) -> Self {
        let service_type = strategy.service_type();
        if self.strategies.insert(service_type, strategy).is_none() {
            self.order.push(service_type);
        }
        self
    }

    pub fn get(&self, service_type: ServiceType) -> Option<Arc<dyn ServiceStrategy>> {
        self.strategies.get(&service_type).cloned()
    }

    pub fn service_types(&self) -> &[ServiceType] {
        &self.order
    }

    /// Catalog built from the registered strategies
    pub fn catalog(&self) -> Catalog {
        Catalog {
            services: self
                .order
                .iter()
                .filter_map(|t| self.strategies.get(t))
                .map(|s| s.catalog_entry())
                .collect(),
        }
    }
}
