//! Provisioning of the per-namespace async storage pod
//!
//! Workspaces with `asyncPersist=true` are ephemeral; their projects are
//! synchronised over rsync+ssh into one storage pod per namespace, backed by
//! the user's common claim. Objects are created directly in the namespace, not
//! through the environment, because they outlive the workspace. Objects that
//! already exist are left as they are.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use kubews_common::{
    Error, NamespaceOps, Result, ASYNC_PERSIST_ATTRIBUTE, ASYNC_STORAGE, PERSIST_VOLUMES_ATTRIBUTE,
};
use kubews_environment::{KubernetesEnvironment, Provisioner, RuntimeIdentity, SshKeyStore};

use crate::config::AsyncStorageConfig;

/// Suffix of the config map holding `authorized_keys`, after the namespace
pub const ASYNC_STORAGE_CONFIG_SUFFIX: &str = "-async-storage-config";
/// Key store service of the storage ssh pair
pub const INTERNAL_SSH_SERVICE: &str = "internal";
/// Name of the storage ssh pair
pub const SSH_KEY_NAME: &str = ASYNC_STORAGE;
/// Config map key holding the public key
pub const AUTHORIZED_KEYS: &str = "authorized_keys";
/// rsync-over-ssh port of the storage pod
pub const SERVICE_PORT: i32 = 2222;
/// Where the common claim is mounted in the storage pod
pub const DATA_PATH: &str = "/async-storage";
/// Where `authorized_keys` is mounted in the storage pod
pub const AUTHORIZED_KEYS_PATH: &str = "/.ssh/authorized_keys";

const APP_LABEL: &str = "app";
const STORAGE_VOLUME: &str = "storage";
const CONFIG_VOLUME: &str = "async-storage-config";

/// Name of the config map holding `authorized_keys` for `namespace`
pub fn config_map_name(namespace: &str) -> String {
    format!("{}{}", namespace, ASYNC_STORAGE_CONFIG_SUFFIX)
}

fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), ASYNC_STORAGE.to_string())])
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(app_labels()),
        ..Default::default()
    }
}

/// Ensures the async storage objects of a namespace exist
pub struct AsyncStorageProvisioner {
    config: AsyncStorageConfig,
    ops: Arc<dyn NamespaceOps>,
    ssh: Arc<dyn SshKeyStore>,
}

impl AsyncStorageProvisioner {
    /// Provisioner creating objects through `ops`, reading keys from `ssh`
    pub fn new(
        config: AsyncStorageConfig,
        ops: Arc<dyn NamespaceOps>,
        ssh: Arc<dyn SshKeyStore>,
    ) -> Self {
        Self { config, ops, ssh }
    }

    fn pvc(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.config.pvc_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![self.config.pvc_access_mode.clone()]),
                storage_class_name: self.config.pvc_storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.config.pvc_quantity.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(&self, config_map: &str) -> Deployment {
        let container = Container {
            name: format!("{}-server", ASYNC_STORAGE),
            image: Some(self.config.image.clone()),
            image_pull_policy: Some(self.config.image_pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                container_port: SERVICE_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: STORAGE_VOLUME.to_string(),
                    mount_path: DATA_PATH.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: AUTHORIZED_KEYS_PATH.to_string(),
                    sub_path: Some(AUTHORIZED_KEYS.to_string()),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Deployment {
            metadata: named(ASYNC_STORAGE),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(app_labels()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(named(ASYNC_STORAGE)),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![
                            Volume {
                                name: STORAGE_VOLUME.to_string(),
                                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                    claim_name: self.config.pvc_name.clone(),
                                    read_only: Some(false),
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: CONFIG_VOLUME.to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: config_map.to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(&self) -> Service {
        Service {
            metadata: named(ASYNC_STORAGE),
            spec: Some(ServiceSpec {
                selector: Some(app_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("rsync-port".to_string()),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(SERVICE_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn public_key(&self, owner: &str) -> Result<String> {
        let pairs = self.ssh.get_pairs(owner, INTERNAL_SSH_SERVICE).await?;
        if let Some(pair) = pairs.into_iter().find(|p| p.name == SSH_KEY_NAME) {
            return Ok(pair.public_key);
        }
        debug!(owner = %owner, "generating async storage ssh pair");
        let pair = self
            .ssh
            .generate_pair(owner, INTERNAL_SSH_SERVICE, SSH_KEY_NAME)
            .await?;
        Ok(pair.public_key)
    }

    async fn ensure_config_map(&self, namespace: &str, name: &str, owner: &str) -> Result<()> {
        if self.ops.get_config_map(namespace, name).await?.is_some() {
            return Ok(());
        }
        let public_key = self.public_key(owner).await?;
        self.ops
            .create_config_map(
                namespace,
                ConfigMap {
                    metadata: named(name),
                    data: Some(BTreeMap::from([(AUTHORIZED_KEYS.to_string(), public_key)])),
                    ..Default::default()
                },
            )
            .await?;
        info!(namespace = %namespace, config_map = %name, "async storage config created");
        Ok(())
    }
}

fn check_attributes(env: &KubernetesEnvironment, config: &AsyncStorageConfig) -> Result<bool> {
    if env.attribute(ASYNC_PERSIST_ATTRIBUTE) != Some("true") {
        return Ok(false);
    }
    if !config.is_common_strategy() {
        return Err(Error::validation(
            "Asynchronous storage available only for 'common' PVC strategy",
        ));
    }
    if env.attribute(PERSIST_VOLUMES_ATTRIBUTE) != Some("false") {
        return Err(Error::validation(
            "Asynchronous storage available only if 'persistVolumes' attribute set to false",
        ));
    }
    Ok(true)
}

#[async_trait]
impl Provisioner for AsyncStorageProvisioner {
    fn name(&self) -> &str {
        "async-storage"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        if !check_attributes(env, &self.config)? {
            return Ok(());
        }

        let namespace = identity.infrastructure_namespace.as_str();

        if self.ops.get_pvc(namespace, &self.config.pvc_name).await?.is_none() {
            self.ops.create_pvc(namespace, self.pvc()).await?;
            info!(namespace = %namespace, claim = %self.config.pvc_name, "common claim created");
        }

        let config_map = config_map_name(namespace);
        self.ensure_config_map(namespace, &config_map, &identity.owner_id)
            .await?;

        if self.ops.get_deployment(namespace, ASYNC_STORAGE).await?.is_none() {
            self.ops
                .create_deployment(namespace, self.deployment(&config_map))
                .await?;
            info!(
                namespace = %namespace,
                workspace_id = %identity.workspace_id,
                "async storage deployment created"
            );
        }

        if self.ops.get_service(namespace, ASYNC_STORAGE).await?.is_none() {
            self.ops.create_service(namespace, self.service()).await?;
            info!(namespace = %namespace, "async storage service created");
        }
        Ok(())
    }
}
