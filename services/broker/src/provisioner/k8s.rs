//! Kubernetes Resource Provisioner
//!
//! Creates database pods and their credential secrets through the
//! Kubernetes API, in the namespace supplied by the broker request.

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvFromSource, Pod, PodSpec, Secret, SecretEnvSource,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{ProvisionerError, ResourceProvisioner, INSTANCE_LABEL, MANAGED_BY_LABEL};
use crate::types::{Credential, ResourceKind, ResourceRef, WorkloadAddress};

const MANAGED_BY: &str = "lornu-broker";
const CREDENTIALS_VOLUME: &str = "admin-credentials";
const CREDENTIALS_MOUNT_PATH: &str = "/etc/broker/credentials";

/// Shape of the pod created for each database instance
#[derive(Debug, Clone)]
pub struct WorkloadTemplate {
    /// Prefix for generated object names (e.g. "dbinst")
    pub name_prefix: String,
    /// Container name inside the pod
    pub container_name: String,
    /// Container image (e.g. "docker.io/mongo:7")
    pub image: String,
    /// Port the database listens on
    pub port: i32,
}

impl Default for WorkloadTemplate {
    fn default() -> Self {
        Self {
            name_prefix: "dbinst".to_string(),
            container_name: "mongodb".to_string(),
            image: "docker.io/mongo:7".to_string(),
            port: 27017,
        }
    }
}

impl WorkloadTemplate {
    pub fn pod_name(&self, instance_id: &str) -> String {
        format!("{}-{}", self.name_prefix, sanitize_name(instance_id))
    }

    pub fn secret_name(&self, instance_id: &str) -> String {
        format!("{}-{}-secret", self.name_prefix, sanitize_name(instance_id))
    }

    fn labels(&self, instance_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (INSTANCE_LABEL.to_string(), sanitize_name(instance_id)),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        ])
    }

    /// Build the credentials secret for an instance
    pub fn build_secret(&self, instance_id: &str, namespace: &str, data: &Credential) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name(instance_id)),
                namespace: Some(namespace.to_string()),
                labels: Some(self.labels(instance_id)),
                ..Default::default()
            },
            string_data: Some(data.clone()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Build the database pod, which reads its admin credentials from `secret_name`
    pub fn build_pod(&self, instance_id: &str, namespace: &str, secret_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(self.pod_name(instance_id)),
                namespace: Some(namespace.to_string()),
                labels: Some(self.labels(instance_id)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: self.container_name.clone(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    env_from: Some(vec![EnvFromSource {
                        secret_ref: Some(SecretEnvSource {
                            name: Some(secret_name.to_string()),
                            optional: Some(false),
                        }),
                        ..Default::default()
                    }]),
                    ports: Some(vec![ContainerPort {
                        name: Some("db".to_string()),
                        container_port: self.port,
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: CREDENTIALS_VOLUME.to_string(),
                        mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: CREDENTIALS_VOLUME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret_name.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Lowercase an instance id and replace characters Kubernetes rejects in names
fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    name.trim_matches('-').to_string()
}

/// Extract the reachable address of a pod, if it is running and has an IP
fn pod_address(pod: &Pod, default_port: i32) -> Option<WorkloadAddress> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    let host = status.pod_ip.clone().filter(|ip| !ip.is_empty())?;

    let port = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .unwrap_or(default_port);

    Some(WorkloadAddress { host, port })
}

/// Provisioner backed by the Kubernetes API
pub struct KubeProvisioner {
    client: Client,
    template: WorkloadTemplate,
}

impl KubeProvisioner {
    /// Create a provisioner using in-cluster or kubeconfig credentials.
    pub async fn new(template: WorkloadTemplate) -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!(image = %template.image, port = template.port, "KubeProvisioner initialized");
        Ok(Self { client, template })
    }
}

#[async_trait]
impl ResourceProvisioner for KubeProvisioner {
    async fn create_secret(
        &self,
        instance_id: &str,
        namespace: &str,
        data: &Credential,
    ) -> Result<ResourceRef, ProvisionerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = self.template.build_secret(instance_id, namespace, data);

        let created = api.create(&PostParams::default(), &secret).await?;
        let name = created
            .metadata
            .name
            .unwrap_or_else(|| self.template.secret_name(instance_id));

        info!(instance_id = %instance_id, namespace = %namespace, secret = %name, "Created instance secret");
        Ok(ResourceRef::new(ResourceKind::Secret, name, namespace))
    }

    async fn create_workload(
        &self,
        instance_id: &str,
        namespace: &str,
        secret: &ResourceRef,
    ) -> Result<ResourceRef, ProvisionerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = self.template.build_pod(instance_id, namespace, &secret.name);

        debug!(instance_id = %instance_id, image = %self.template.image, "Deploying database pod");
        let created = api.create(&PostParams::default(), &pod).await?;
        let name = created
            .metadata
            .name
            .unwrap_or_else(|| self.template.pod_name(instance_id));

        info!(instance_id = %instance_id, namespace = %namespace, pod = %name, "Provisioned instance pod");
        Ok(ResourceRef::new(ResourceKind::Workload, name, namespace))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ProvisionerError> {
        let result = match resource.kind {
            ResourceKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &resource.namespace);
                api.delete(&resource.name, &DeleteParams::default())
                    .await
                    .map(|_| ())
            }
            ResourceKind::Workload => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &resource.namespace);
                api.delete(&resource.name, &DeleteParams::default())
                    .await
                    .map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                info!(resource = %resource, "Deleted instance resource");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(resource = %resource, "Resource already absent, treating as deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn workload_address(
        &self,
        workload: &ResourceRef,
    ) -> Result<WorkloadAddress, ProvisionerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);

        let pod = match api.get(&workload.name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(ProvisionerError::NotFound(workload.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        pod_address(&pod, self.template.port)
            .ok_or_else(|| ProvisionerError::NotReady(workload.to_string()))
    }

    async fn platform_version(&self) -> Result<String, ProvisionerError> {
        let info = self.client.apiserver_version().await?;
        Ok(format!("{} ({})", info.git_version, info.platform))
    }
}
