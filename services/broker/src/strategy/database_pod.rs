//! Database pod service
//!
//! Each instance is one database pod plus a secret holding its generated
//! admin credentials, created in the namespace from the request context.
//! Binds look up the pod address and hand out a connection credential.

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Binding, ProvisionRequest, Provisioned, ServiceStrategy};
use crate::catalog::Service;
use crate::error::{BrokerError, Result};
use crate::provisioner::{ProvisionerError, ResourceProvisioner};
use crate::saga::Compensation;
use crate::types::{BackingResources, Credential, ServiceInstance, ServiceType};

const SERVICE_ID: &str = "0c3a1d52-8f7e-4b9a-a6d4-2e5f7c91b803";
const PLAN_ID: &str = "5b8e2f40-1c6d-4e3a-9f72-d84a0b6c1e97";

pub const USERNAME_KEY: &str = "MONGO_INITDB_ROOT_USERNAME";
pub const PASSWORD_KEY: &str = "MONGO_INITDB_ROOT_PASSWORD";
const ADMIN_USER: &str = "admin";
const PASSWORD_LEN: usize = 24;

fn generate_admin_credentials() -> Credential {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect();

    Credential::from([
        (USERNAME_KEY.to_string(), ADMIN_USER.to_string()),
        (PASSWORD_KEY.to_string(), password),
    ])
}

pub struct DatabasePodStrategy {
    provisioner: Arc<dyn ResourceProvisioner>,
    uri_scheme: String,
}

impl DatabasePodStrategy {
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        Self {
            provisioner,
            uri_scheme: "mongodb".to_string(),
        }
    }

    /// Override the scheme used for the `uri` field of bind credentials
    pub fn with_uri_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.uri_scheme = scheme.into();
        self
    }

    async fn rollback(&self, saga: Compensation, instance_id: &str, cause: String) -> BrokerError {
        let leaked = saga.unwind().await;
        if leaked.is_empty() {
            return BrokerError::ProvisioningFailure(cause);
        }

        let leaked: Vec<String> = leaked.iter().map(|r| r.to_string()).collect();
        warn!(instance_id = %instance_id, leaked = ?leaked, "Rollback left resources behind");
        BrokerError::ProvisioningFailure(format!(
            "{}; rollback could not remove: {}",
            cause,
            leaked.join(", ")
        ))
    }
}

#[async_trait]
impl ServiceStrategy for DatabasePodStrategy {
    fn service_type(&self) -> ServiceType {
        ServiceType::DatabasePod
    }

    fn catalog_entry(&self) -> Service {
        Service::with_default_plan(
            ServiceType::DatabasePod,
            SERVICE_ID,
            "database-pod-service",
            "A database running as a pod in the requesting namespace",
            PLAN_ID,
            "Single database pod with generated admin credentials",
        )
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<Provisioned> {
        let instance_id = request.instance_id;
        let namespace = request.location.ok_or_else(|| {
            BrokerError::InvalidRequest("request context does not contain a namespace".to_string())
        })?;

        let admin = generate_admin_credentials();
        let mut saga = Compensation::new(self.provisioner.clone());

        let secret = match self
            .provisioner
            .create_secret(instance_id, namespace, &admin)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                let cause = format!("failed to create secret: {}", e);
                return Err(self.rollback(saga, instance_id, cause).await);
            }
        };
        saga.record(secret.clone());

        let workload = match self
            .provisioner
            .create_workload(instance_id, namespace, &secret)
            .await
        {
            Ok(workload) => workload,
            Err(e) => {
                let cause = format!("failed to create workload: {}", e);
                return Err(self.rollback(saga, instance_id, cause).await);
            }
        };
        saga.record(workload.clone());
        saga.commit();

        info!(instance_id = %instance_id, namespace = %namespace, "Provisioned database pod instance");
        Ok(Provisioned {
            credential: None,
            backing: Some(BackingResources { secret, workload }),
        })
    }

    async fn deprovision(&self, instance: &ServiceInstance) -> Result<()> {
        let Some(backing) = &instance.backing else {
            warn!(instance_id = %instance.id, "Instance has no backing resources to release");
            return Ok(());
        };

        // Workload first: it consumes the secret.
        for resource in [&backing.workload, &backing.secret] {
            match self.provisioner.delete(resource).await {
                Ok(()) | Err(ProvisionerError::NotFound(_)) => {}
                Err(e) => {
                    return Err(BrokerError::ProvisioningFailure(format!(
                        "failed to delete {}: {}",
                        resource, e
                    )))
                }
            }
        }

        info!(instance_id = %instance.id, "Deprovisioned database pod instance");
        Ok(())
    }

    async fn bind(&self, instance: &ServiceInstance, binding_id: &str) -> Result<Binding> {
        let backing = instance.backing.as_ref().ok_or_else(|| {
            BrokerError::ProvisioningFailure(format!(
                "instance {} has no backing workload",
                instance.id
            ))
        })?;

        let address = self.provisioner.workload_address(&backing.workload).await?;

        info!(
            instance_id = %instance.id,
            binding_id = %binding_id,
            host = %address.host,
            port = address.port,
            "Resolved database pod address"
        );

        let credential = Credential::from([
            ("host".to_string(), address.host.clone()),
            ("port".to_string(), address.port.to_string()),
            (
                "uri".to_string(),
                format!("{}://{}:{}", self.uri_scheme, address.host, address.port),
            ),
            ("secretName".to_string(), backing.secret.name.clone()),
        ]);

        Ok(Binding {
            credential,
            persist: true,
        })
    }

    async fn unbind(&self, instance: &ServiceInstance, binding_id: &str) -> Result<()> {
        // TODO: drop the per-binding database user once binds create one
        info!(instance_id = %instance.id, binding_id = %binding_id, "Database pod unbind has no teardown");
        Ok(())
    }
}
