//! Instance Lifecycle Controller
//!
//! Entry point for every broker operation. Owns the instance registry and
//! the strategy table; dispatches per service type and keeps the registry
//! consistent with what exists on the platform:
//!
//! - an id is reserved before provisioning and published only after every
//!   provisioning step succeeded; a create dropped midway frees the id,
//! - an instance is forgotten only after its backing resources are released,
//! - the registry lock is never held across a provisioner call.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{BrokerError, Result};
use crate::provisioner::ResourceProvisioner;
use crate::registry::InstanceRegistry;
use crate::strategy::{ProvisionRequest, ServiceStrategy, StrategyTable};
use crate::types::{
    BindingRequest, CreateServiceBindingResponse, CreateServiceInstanceRequest,
    CreateServiceInstanceResponse, DeleteServiceInstanceResponse, ServiceInstance,
};

pub struct InstanceLifecycleController {
    registry: InstanceRegistry,
    strategies: StrategyTable,
    catalog: Catalog,
    /// Used for platform diagnostics only
    provisioner: Option<Arc<dyn ResourceProvisioner>>,
}

impl InstanceLifecycleController {
    pub fn new(strategies: StrategyTable) -> Self {
        let catalog = strategies.catalog();
        Self {
            registry: InstanceRegistry::new(),
            strategies,
            catalog,
            provisioner: None,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    fn strategy_for(&self, instance: &ServiceInstance) -> Result<Arc<dyn ServiceStrategy>> {
        self.strategies.get(instance.service_type).ok_or_else(|| {
            BrokerError::InvalidRequest(format!(
                "service type {} is not available",
                instance.service_type
            ))
        })
    }

    /// Provision a new instance.
    pub async fn create(
        &self,
        id: &str,
        request: &CreateServiceInstanceRequest,
    ) -> Result<CreateServiceInstanceResponse> {
        let service_type = self.catalog.resolve(&request.service_id);
        let strategy = service_type.and_then(|t| self.strategies.get(t));

        let reservation = self.registry.reserve(id).await?;

        let (service_type, strategy) = match (service_type, strategy) {
            (Some(t), Some(s)) => (t, s),
            _ => {
                reservation.release().await;
                return Err(BrokerError::InvalidRequest(format!(
                    "unknown service {}",
                    request.service_id
                )));
            }
        };

        let location = request.location();
        let provisioned = strategy
            .provision(ProvisionRequest {
                instance_id: id,
                location,
                parameters: &request.parameters,
            })
            .await;

        let provisioned = match provisioned {
            Ok(p) => p,
            Err(e) => {
                reservation.release().await;
                warn!(instance_id = %id, service_type = %service_type, error = %e, "Create failed");
                return Err(e);
            }
        };

        reservation
            .commit(ServiceInstance {
                id: id.to_string(),
                service_type,
                plan_id: request.plan_id.clone(),
                location: location.map(str::to_string),
                credential: provisioned.credential,
                backing: provisioned.backing,
                created_at: Utc::now(),
            })
            .await;

        info!(instance_id = %id, service_type = %service_type, "Created service instance");
        Ok(CreateServiceInstanceResponse::default())
    }

    /// Fetch an instance
    pub async fn get(&self, id: &str) -> Result<ServiceInstance> {
        self.registry.get(id).await
    }

    /// Release an instance's backing resources, then forget it.
    ///
    /// A failed teardown leaves the instance registered so the call can be retried.
    pub async fn remove(&self, id: &str) -> Result<DeleteServiceInstanceResponse> {
        let instance = self.registry.begin_removal(id).await?;

        let teardown = match self.strategy_for(&instance) {
            Ok(strategy) => strategy.deprovision(&instance).await,
            Err(e) => Err(e),
        };

        if let Err(e) = teardown {
            self.registry.abort_removal(id).await;
            warn!(instance_id = %id, error = %e, "Teardown failed, keeping instance for retry");
            return Err(e);
        }

        self.registry.finish_removal(id).await;
        info!(instance_id = %id, service_type = %instance.service_type, "Removed service instance");
        Ok(DeleteServiceInstanceResponse::default())
    }

    /// Issue credentials for an instance.
    ///
    /// Pod-backed binds re-query the workload each time and overwrite the
    /// stored credential, so repeated binds may return different values.
    /// A bind whose instance was removed and replaced meanwhile stores
    /// nothing and fails with `NotFound`.
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        _request: &BindingRequest,
    ) -> Result<CreateServiceBindingResponse> {
        let snapshot = self.registry.snapshot_ready(instance_id).await?;
        let strategy = self.strategy_for(&snapshot.instance)?;

        let binding = strategy.bind(&snapshot.instance, binding_id).await?;

        if binding.persist {
            self.registry
                .store_credential(instance_id, snapshot.generation, binding.credential.clone())
                .await?;
        }

        info!(instance_id = %instance_id, binding_id = %binding_id, "Bound service instance");
        Ok(CreateServiceBindingResponse {
            credentials: binding.credential,
        })
    }

    /// Release a binding. Succeeds for any visible instance, including one being torn down.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        let instance = self.registry.get(instance_id).await?;
        let strategy = self.strategy_for(&instance)?;

        strategy.unbind(&instance, binding_id).await?;
        info!(instance_id = %instance_id, binding_id = %binding_id, "Unbound service instance");
        Ok(())
    }

    /// Report the orchestration platform version
    pub async fn debug(&self) -> Result<String> {
        warn!("External debug request");
        let provisioner = self.provisioner.as_ref().ok_or_else(|| {
            BrokerError::Unavailable("no resource provisioner configured".to_string())
        })?;
        Ok(provisioner.platform_version().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::fake::FakeProvisioner;
    use crate::provisioner::ProvisionerError;
    use crate::strategy::{placeholder_credential, DatabasePodStrategy, UserProvidedStrategy};
    use crate::types::{Credential, ResourceKind, ResourceRef, ServiceType, WorkloadAddress};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    fn controller(fake: &Arc<FakeProvisioner>) -> InstanceLifecycleController {
        let table = StrategyTable::new()
            .register(Arc::new(UserProvidedStrategy::new()))
            .register(Arc::new(DatabasePodStrategy::new(fake.clone())));
        InstanceLifecycleController::new(table).with_provisioner(fake.clone())
    }

    fn user_provided(parameters: serde_json::Value) -> CreateServiceInstanceRequest {
        CreateServiceInstanceRequest {
            service_id: "user-provided".to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn database_pod(namespace: Option<&str>) -> CreateServiceInstanceRequest {
        let mut req = CreateServiceInstanceRequest {
            service_id: "database-pod".to_string(),
            ..Default::default()
        };
        req.context.namespace = namespace.map(str::to_string);
        req
    }

    #[tokio::test]
    async fn test_user_provided_scenario() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);

        controller
            .create("svc-1", &user_provided(json!({})))
            .await
            .unwrap();

        let instance = controller.get("svc-1").await.unwrap();
        assert_eq!(instance.service_type, ServiceType::UserProvided);
        assert_eq!(instance.credential, Some(placeholder_credential()));
        assert_eq!(
            instance.credential.as_ref().unwrap()["special-key-1"],
            "special-value-1"
        );

        controller.remove("svc-1").await.unwrap();
        assert!(matches!(
            controller.get("svc-1").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(fake.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_original_untouched() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);

        controller
            .create(
                "svc-1",
                &user_provided(json!({"credentials": {"user": "alice"}})),
            )
            .await
            .unwrap();
        let original = controller.get("svc-1").await.unwrap();

        let err = controller
            .create("svc-1", &user_provided(json!({"credentials": {"user": "bob"}})))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists(_)));

        let err = controller
            .create("svc-1", &database_pod(Some("team-a")))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists(_)));

        assert_eq!(controller.get("svc-1").await.unwrap(), original);
        assert!(fake.live().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service_is_invalid() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        let req = CreateServiceInstanceRequest {
            service_id: "redis".to_string(),
            ..Default::default()
        };

        let err = controller.create("x-1", &req).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));
        assert!(controller.registry().is_empty().await);

        // The id was released and can be used again
        controller
            .create("x-1", &user_provided(json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_database_pod_without_location_is_invalid() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);

        for namespace in [None, Some(""), Some("  ")] {
            let err = controller
                .create("db-1", &database_pod(namespace))
                .await
                .unwrap_err();
            assert!(matches!(err, BrokerError::InvalidRequest(_)));
        }

        assert!(matches!(
            controller.get("db-1").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(fake.live().is_empty());
        assert!(fake.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_partial_provisioning_is_rolled_back() {
        let fake = Arc::new(FakeProvisioner::new());
        fake.fail_workload_creation();
        let controller = controller(&fake);

        let err = controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::ProvisioningFailure(_)));
        assert!(matches!(
            controller.get("db-1").await,
            Err(BrokerError::NotFound(_))
        ));
        assert_eq!(fake.deleted().len(), 1);
        assert_eq!(fake.deleted()[0].kind, ResourceKind::Secret);
        assert!(fake.live().is_empty());
    }

    #[tokio::test]
    async fn test_secret_failure_creates_nothing() {
        let fake = Arc::new(FakeProvisioner::new());
        fake.fail_secret_creation();
        let controller = controller(&fake);

        let err = controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::ProvisioningFailure(_)));
        assert!(fake.deleted().is_empty());
        assert!(controller.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_instance_until_retry() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap();

        fake.fail_next_deletes(1);
        let err = controller.remove("db-1").await.unwrap_err();
        assert!(matches!(err, BrokerError::ProvisioningFailure(_)));
        assert!(controller.get("db-1").await.is_ok());

        controller.remove("db-1").await.unwrap();
        assert!(matches!(
            controller.get("db-1").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(fake.live().is_empty());

        assert!(matches!(
            controller.remove("db-1").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_user_provided_bind_is_stable() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        controller
            .create(
                "svc-1",
                &user_provided(json!({"credentials": {"token": "abc", "port": 8080}})),
            )
            .await
            .unwrap();

        let first = controller
            .bind("svc-1", "b-1", &BindingRequest::default())
            .await
            .unwrap();
        let second = controller
            .bind("svc-1", "b-2", &BindingRequest::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.credentials["token"], "abc");
        assert_eq!(first.credentials["port"], "8080");

        controller.unbind("svc-1", "b-1").await.unwrap();
        assert_eq!(
            controller.get("svc-1").await.unwrap().credential,
            Some(first.credentials)
        );
    }

    #[tokio::test]
    async fn test_database_pod_bind_lifecycle() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap();
        assert!(controller.get("db-1").await.unwrap().credential.is_none());

        // Not ready yet: nothing stored
        let err = controller
            .bind("db-1", "b-1", &BindingRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(controller.get("db-1").await.unwrap().credential.is_none());

        fake.set_ready("db-1", "10.0.0.7", 27017);
        let first = controller
            .bind("db-1", "b-1", &BindingRequest::default())
            .await
            .unwrap();
        assert_eq!(first.credentials["uri"], "mongodb://10.0.0.7:27017");
        assert_eq!(
            controller.get("db-1").await.unwrap().credential,
            Some(first.credentials.clone())
        );

        // Pod rescheduled: rebind overwrites the stored credential
        fake.set_ready("db-1", "10.0.0.8", 27017);
        let second = controller
            .bind("db-1", "b-2", &BindingRequest::default())
            .await
            .unwrap();
        assert_ne!(first, second);
        let stored: Credential = controller.get("db-1").await.unwrap().credential.unwrap();
        assert_eq!(stored["host"], "10.0.0.8");

        // Unbind keeps the stored credential
        controller.unbind("db-1", "b-1").await.unwrap();
        assert_eq!(
            controller.get("db-1").await.unwrap().credential,
            Some(second.credentials)
        );
    }

    #[tokio::test]
    async fn test_address_query_failure_is_provisioning_failure() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap();

        fake.fail_address_lookup();
        let err = controller
            .bind("db-1", "b-1", &BindingRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ProvisioningFailure(_)));
    }

    #[tokio::test]
    async fn test_bind_and_unbind_unknown_instance() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);

        assert!(matches!(
            controller
                .bind("nope", "b-1", &BindingRequest::default())
                .await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(matches!(
            controller.unbind("nope", "b-1").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_exactly_one() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = Arc::new(controller(&fake));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .create("db-1", &database_pod(Some("team-a")))
                    .await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, BrokerError::AlreadyExists(_))),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(fake.live().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_see_partial_instances() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = Arc::new(controller(&fake));

        let writer = {
            let controller = controller.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let id = format!("db-{i}");
                    controller
                        .create(&id, &database_pod(Some("team-a")))
                        .await
                        .unwrap();
                }
            })
        };

        let reader = {
            let controller = controller.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    for i in 0..20 {
                        if let Ok(instance) = controller.get(&format!("db-{i}")).await {
                            assert!(instance.backing.is_some());
                            assert_eq!(instance.location.as_deref(), Some("team-a"));
                        }
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
        assert_eq!(controller.registry().len().await, 20);
    }

    #[tokio::test]
    async fn test_debug_reports_platform_version() {
        let fake = Arc::new(FakeProvisioner::new());
        assert_eq!(controller(&fake).debug().await.unwrap(), "v1.29.0-fake");

        let bare =
            InstanceLifecycleController::new(StrategyTable::new().register(Arc::new(
                UserProvidedStrategy::new(),
            )));
        assert!(matches!(
            bare.debug().await,
            Err(BrokerError::Unavailable(_))
        ));
    }

    /// Parks workload creation or address lookup until the test releases it
    struct GatedProvisioner {
        inner: Arc<FakeProvisioner>,
        gate_workloads: bool,
        gate_addresses: bool,
        entered: Notify,
        release: Notify,
    }

    impl GatedProvisioner {
        fn new(inner: Arc<FakeProvisioner>, gate_workloads: bool, gate_addresses: bool) -> Self {
            Self {
                inner,
                gate_workloads,
                gate_addresses,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }

        async fn park(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl ResourceProvisioner for GatedProvisioner {
        async fn create_secret(
            &self,
            instance_id: &str,
            namespace: &str,
            data: &Credential,
        ) -> Result<ResourceRef, ProvisionerError> {
            self.inner.create_secret(instance_id, namespace, data).await
        }

        async fn create_workload(
            &self,
            instance_id: &str,
            namespace: &str,
            secret: &ResourceRef,
        ) -> Result<ResourceRef, ProvisionerError> {
            if self.gate_workloads {
                self.park().await;
            }
            self.inner.create_workload(instance_id, namespace, secret).await
        }

        async fn delete(&self, resource: &ResourceRef) -> Result<(), ProvisionerError> {
            self.inner.delete(resource).await
        }

        async fn workload_address(
            &self,
            workload: &ResourceRef,
        ) -> Result<WorkloadAddress, ProvisionerError> {
            let address = self.inner.workload_address(workload).await;
            if self.gate_addresses {
                self.park().await;
            }
            address
        }

        async fn platform_version(&self) -> Result<String, ProvisionerError> {
            self.inner.platform_version().await
        }
    }

    fn gated_controller(gated: &Arc<GatedProvisioner>) -> Arc<InstanceLifecycleController> {
        let table = StrategyTable::new()
            .register(Arc::new(UserProvidedStrategy::new()))
            .register(Arc::new(DatabasePodStrategy::new(gated.clone())));
        Arc::new(InstanceLifecycleController::new(table))
    }

    #[tokio::test]
    async fn test_slow_bind_leaves_replacement_instance_alone() {
        let fake = Arc::new(FakeProvisioner::new());
        let gated = Arc::new(GatedProvisioner::new(fake.clone(), false, true));
        let controller = gated_controller(&gated);

        controller
            .create("x", &database_pod(Some("team-a")))
            .await
            .unwrap();
        fake.set_ready("x", "10.9.9.9", 27017);

        let bind = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .bind("x", "b-1", &BindingRequest::default())
                    .await
            })
        };
        gated.entered.notified().await;

        // Same id, different instance, while the bind is still in flight
        controller.remove("x").await.unwrap();
        controller
            .create("x", &user_provided(json!({"credentials": {"token": "secret"}})))
            .await
            .unwrap();

        gated.release.notify_one();
        let result = bind.await.unwrap();
        assert!(matches!(result, Err(BrokerError::NotFound(_))));

        let replacement = controller.get("x").await.unwrap();
        assert_eq!(replacement.service_type, ServiceType::UserProvided);
        assert_eq!(
            replacement.credential,
            Some(Credential::from([(
                "token".to_string(),
                "secret".to_string()
            )]))
        );
    }

    #[tokio::test]
    async fn test_unbind_succeeds_during_teardown() {
        let fake = Arc::new(FakeProvisioner::new());
        let controller = controller(&fake);
        controller
            .create("db-1", &database_pod(Some("team-a")))
            .await
            .unwrap();

        controller.registry().begin_removal("db-1").await.unwrap();

        controller.unbind("db-1", "b-1").await.unwrap();
        assert!(matches!(
            controller
                .bind("db-1", "b-2", &BindingRequest::default())
                .await,
            Err(BrokerError::OperationInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_create_frees_the_id() {
        let fake = Arc::new(FakeProvisioner::new());
        let gated = Arc::new(GatedProvisioner::new(fake.clone(), true, false));
        let controller = gated_controller(&gated);

        let create = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .create("db-1", &database_pod(Some("team-a")))
                    .await
            })
        };
        gated.entered.notified().await;

        create.abort();
        assert!(create.await.unwrap_err().is_cancelled());

        controller
            .create("db-1", &user_provided(json!({})))
            .await
            .unwrap();
        assert_eq!(
            controller.get("db-1").await.unwrap().service_type,
            ServiceType::UserProvided
        );
    }
}
