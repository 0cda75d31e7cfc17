//! Resource Provisioners
//!
//! Trait-based abstraction over the orchestration platform that creates and
//! destroys the backing objects of an instance (a credentials secret and the
//! workload consuming it).

pub mod k8s;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::BrokerError;
use crate::types::{Credential, ResourceRef, WorkloadAddress};

pub use k8s::{KubeProvisioner, WorkloadTemplate};

/// Label carried by every object created for an instance
pub const INSTANCE_LABEL: &str = "lornu.ai/instance-id";

/// Label marking objects owned by the broker
pub const MANAGED_BY_LABEL: &str = "lornu.ai/managed-by";

/// Errors raised by a resource provisioner
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// The object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// The object exists but cannot serve yet (no address, not running)
    #[error("{0} is not ready")]
    NotReady(String),

    /// Kubernetes API call failed
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ProvisionerError> for BrokerError {
    fn from(err: ProvisionerError) -> Self {
        match err {
            ProvisionerError::NotReady(what) => {
                BrokerError::Unavailable(format!("{} is not ready", what))
            }
            other => BrokerError::ProvisioningFailure(other.to_string()),
        }
    }
}

/// Capability set the lifecycle controller needs from the platform
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Create the secret holding an instance's generated credentials
    async fn create_secret(
        &self,
        instance_id: &str,
        namespace: &str,
        data: &Credential,
    ) -> Result<ResourceRef, ProvisionerError>;

    /// Create the workload for an instance, consuming the given secret
    async fn create_workload(
        &self,
        instance_id: &str,
        namespace: &str,
        secret: &ResourceRef,
    ) -> Result<ResourceRef, ProvisionerError>;

    /// Delete a previously created object. An already absent object is success.
    async fn delete(&self, resource: &ResourceRef) -> Result<(), ProvisionerError>;

    /// Look up the network address of a running workload
    async fn workload_address(
        &self,
        workload: &ResourceRef,
    ) -> Result<WorkloadAddress, ProvisionerError>;

    /// Human readable version of the orchestration platform
    async fn platform_version(&self) -> Result<String, ProvisionerError>;
}
