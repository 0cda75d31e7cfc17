//! In-memory provisioner with failure injection, for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ProvisionerError, ResourceProvisioner};
use crate::types::{Credential, ResourceKind, ResourceRef, WorkloadAddress};

#[derive(Default)]
struct State {
    /// Live objects keyed by "kind/namespace/name"
    objects: HashMap<String, ResourceRef>,
    /// Secret payloads keyed like `objects`
    secrets: HashMap<String, Credential>,
    addresses: HashMap<String, WorkloadAddress>,
    deleted: Vec<ResourceRef>,
    fail_secret: bool,
    fail_workload: bool,
    fail_deletes: usize,
    fail_address: bool,
}

fn key(resource: &ResourceRef) -> String {
    format!("{}/{}/{}", resource.kind, resource.namespace, resource.name)
}

#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<State>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_secret_creation(&self) {
        self.state.lock().unwrap().fail_secret = true;
    }

    pub fn fail_workload_creation(&self) {
        self.state.lock().unwrap().fail_workload = true;
    }

    /// Fail the next `count` delete calls with an API error
    pub fn fail_next_deletes(&self, count: usize) {
        self.state.lock().unwrap().fail_deletes = count;
    }

    pub fn fail_address_lookup(&self) {
        self.state.lock().unwrap().fail_address = true;
    }

    /// Mark the workload of `instance_id` as running at `host:port`
    pub fn set_ready(&self, instance_id: &str, host: &str, port: i32) {
        self.state.lock().unwrap().addresses.insert(
            instance_id.to_string(),
            WorkloadAddress {
                host: host.to_string(),
                port,
            },
        );
    }

    /// Objects that currently exist
    pub fn live(&self) -> Vec<ResourceRef> {
        let mut live: Vec<_> = self.state.lock().unwrap().objects.values().cloned().collect();
        live.sort_by(|a, b| a.name.cmp(&b.name));
        live
    }

    pub fn deleted(&self) -> Vec<ResourceRef> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn secret_data(&self, secret: &ResourceRef) -> Option<Credential> {
        self.state.lock().unwrap().secrets.get(&key(secret)).cloned()
    }
}

#[async_trait]
impl ResourceProvisioner for FakeProvisioner {
    async fn create_secret(
        &self,
        instance_id: &str,
        namespace: &str,
        data: &Credential,
    ) -> Result<ResourceRef, ProvisionerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_secret {
            return Err(ProvisionerError::Other("secret quota exceeded".to_string()));
        }
        let secret = ResourceRef::new(
            ResourceKind::Secret,
            format!("dbinst-{}-secret", instance_id),
            namespace,
        );
        state.objects.insert(key(&secret), secret.clone());
        state.secrets.insert(key(&secret), data.clone());
        Ok(secret)
    }

    async fn create_workload(
        &self,
        instance_id: &str,
        namespace: &str,
        _secret: &ResourceRef,
    ) -> Result<ResourceRef, ProvisionerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_workload {
            return Err(ProvisionerError::Other("image pull denied".to_string()));
        }
        let pod = ResourceRef::new(
            ResourceKind::Workload,
            format!("dbinst-{}", instance_id),
            namespace,
        );
        state.objects.insert(key(&pod), pod.clone());
        Ok(pod)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ProvisionerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes > 0 {
            state.fail_deletes -= 1;
            return Err(ProvisionerError::Other("apiserver timeout".to_string()));
        }
        // Absent objects count as deleted
        state.objects.remove(&key(resource));
        state.secrets.remove(&key(resource));
        state.deleted.push(resource.clone());
        Ok(())
    }

    async fn workload_address(
        &self,
        workload: &ResourceRef,
    ) -> Result<WorkloadAddress, ProvisionerError> {
        let state = self.state.lock().unwrap();
        if state.fail_address {
            return Err(ProvisionerError::Other("apiserver timeout".to_string()));
        }
        if !state.objects.contains_key(&key(workload)) {
            return Err(ProvisionerError::NotFound(workload.to_string()));
        }
        let instance_id = workload.name.trim_start_matches("dbinst-");
        state
            .addresses
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProvisionerError::NotReady(workload.to_string()))
    }

    async fn platform_version(&self) -> Result<String, ProvisionerError> {
        Ok("v1.29.0-fake".to_string())
    }
}
