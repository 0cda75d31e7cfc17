//! Provisioning Compensation
//!
//! Multi-step provisioning records every object it successfully creates.
//! If a later step fails the recorded objects are deleted again, newest
//! first, so a failed create never leaves orphans on the cluster.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::provisioner::ResourceProvisioner;
use crate::types::ResourceRef;

/// Compensating actions accumulated during a forward provisioning run.
///
/// Must be finished with either [`Compensation::commit`] or
/// [`Compensation::unwind`]; dropping it with recorded resources only logs,
/// since cleanup requires async calls.
pub struct Compensation {
    provisioner: Arc<dyn ResourceProvisioner>,
    created: Vec<ResourceRef>,
    finished: bool,
}

impl Compensation {
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        Self {
            provisioner,
            created: Vec::new(),
            finished: false,
        }
    }

    /// Record an object created by a forward step
    pub fn record(&mut self, resource: ResourceRef) {
        self.created.push(resource);
    }

    pub fn recorded(&self) -> &[ResourceRef] {
        &self.created
    }

    /// All steps succeeded; keep everything that was created.
    pub fn commit(mut self) {
        self.finished = true;
    }

    /// Delete the recorded objects in reverse creation order.
    ///
    /// Best effort: every deletion is attempted, failures are logged and the
    /// objects that could not be removed are returned.
    pub async fn unwind(mut self) -> Vec<ResourceRef> {
        self.finished = true;
        let mut leaked = Vec::new();

        for resource in std::mem::take(&mut self.created).into_iter().rev() {
            match self.provisioner.delete(&resource).await {
                Ok(()) => info!(resource = %resource, "Rolled back partially provisioned resource"),
                Err(e) => {
                    error!(resource = %resource, error = %e, "Rollback failed, resource may be orphaned");
                    leaked.push(resource);
                }
            }
        }

        leaked
    }
}

impl Drop for Compensation {
    fn drop(&mut self) {
        if !self.finished && !self.created.is_empty() {
            warn!(
                count = self.created.len(),
                "Compensation dropped without commit or rollback"
            );
        }
    }
}
