//! User-provided service: the caller supplies the credential at creation.
//! Nothing is provisioned and binds return the stored credential unchanged.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Binding, ProvisionRequest, Provisioned, ServiceStrategy};
use crate::catalog::Service;
use crate::error::Result;
use crate::types::{Credential, ServiceInstance, ServiceType};

const SERVICE_ID: &str = "4f6e6cf6-ffdd-425f-a2c7-3c9258ad2468";
const PLAN_ID: &str = "86064792-7ea2-467b-af93-ac9694d96d52";

/// Credential used when the caller supplies none
pub fn placeholder_credential() -> Credential {
    Credential::from([
        ("special-key-1".to_string(), "special-value-1".to_string()),
        ("special-key-2".to_string(), "special-value-2".to_string()),
    ])
}

/// Read `parameters.credentials` as a flat map of scalars.
///
/// Strings are taken verbatim, numbers and booleans as their JSON text.
/// Returns `None` if the key is missing or any value is not a scalar.
fn credential_from_parameters(parameters: &serde_json::Map<String, Value>) -> Option<Credential> {
    let object = parameters.get("credentials")?.as_object()?;

    object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct UserProvidedStrategy;

impl UserProvidedStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServiceStrategy for UserProvidedStrategy {
    fn service_type(&self) -> ServiceType {
        ServiceType::UserProvided
    }

    fn catalog_entry(&self) -> Service {
        Service::with_default_plan(
            ServiceType::UserProvided,
            SERVICE_ID,
            "user-provided-service",
            "A user provided service",
            PLAN_ID,
            "Sample plan description",
        )
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<Provisioned> {
        let credential = match credential_from_parameters(request.parameters) {
            Some(credential) => credential,
            None => {
                if request.parameters.contains_key("credentials") {
                    warn!(
                        instance_id = %request.instance_id,
                        "Ignoring malformed credentials parameter, using placeholder"
                    );
                }
                placeholder_credential()
            }
        };

        Ok(Provisioned {
            credential: Some(credential),
            backing: None,
        })
    }

    async fn deprovision(&self, instance: &ServiceInstance) -> Result<()> {
        debug!(instance_id = %instance.id, "Nothing to deprovision for user-provided instance");
        Ok(())
    }

    async fn bind(&self, instance: &ServiceInstance, _binding_id: &str) -> Result<Binding> {
        Ok(Binding {
            credential: instance
                .credential
                .clone()
                .unwrap_or_else(placeholder_credential),
            persist: false,
        })
    }

    async fn unbind(&self, instance: &ServiceInstance, binding_id: &str) -> Result<()> {
        // Bindings are not persisted, so there is nothing to undo.
        debug!(instance_id = %instance.id, binding_id = %binding_id, "Unbind is a no-op");
        Ok(())
    }
}
