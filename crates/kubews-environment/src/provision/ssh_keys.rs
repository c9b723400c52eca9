//! VCS SSH keys for workspace containers
//!
//! The owner's `vcs` key pairs are put into a secret mounted at
//! `/etc/ssh/private`, with an ssh config that maps each host to its key.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use kubews_common::kube_utils::sanitize_dns_label;
use kubews_common::{Result, WORKSPACE_ID_LABEL};

use crate::identity::RuntimeIdentity;
use crate::model::{KubernetesEnvironment, PodRole};
use crate::pipeline::Provisioner;
use crate::stores::{SshKeyStore, SshPair};
use crate::warnings;

/// Key store service the VCS keys are kept under
pub const VCS_SSH_SERVICE: &str = "vcs";
/// Directory the private keys are mounted into
pub const SSH_PRIVATE_KEYS_PATH: &str = "/etc/ssh/private";
/// Path of the generated ssh client config
pub const SSH_CONFIG_PATH: &str = "/etc/ssh/ssh_config";

const SSH_CONFIG_KEY: &str = "ssh_config";
const SSH_KEYS_VOLUME: &str = "ssh-keys";
const SSH_CONFIG_VOLUME: &str = "ssh-config";
const PRIVATE_KEY_MODE: i32 = 0o600;

fn key_file_name(pair: &SshPair) -> String {
    sanitize_dns_label(&pair.name, 253)
}

fn render_ssh_config(pairs: &[&SshPair]) -> String {
    pairs
        .iter()
        .map(|pair| {
            format!(
                "host {}\nIdentityFile {}/{}\nStrictHostKeyChecking = no\n\n",
                pair.name,
                SSH_PRIVATE_KEYS_PATH,
                key_file_name(pair)
            )
        })
        .collect()
}

/// Mounts the owner's VCS keys
pub struct SshKeysProvisioner {
    keys: Arc<dyn SshKeyStore>,
}

impl SshKeysProvisioner {
    /// Provisioner reading from `keys`
    pub fn new(keys: Arc<dyn SshKeyStore>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Provisioner for SshKeysProvisioner {
    fn name(&self) -> &str {
        "ssh-keys"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let pairs = match self.keys.get_pairs(&identity.owner_id, VCS_SSH_SERVICE).await {
            Ok(pairs) => pairs,
            Err(e) => {
                env.warn(
                    warnings::NOT_ABLE_TO_PROVISION_SSH_KEYS,
                    format!("Unable to provision SSH keys into the workspace: {}", e),
                );
                return Ok(());
            }
        };

        let usable: Vec<&SshPair> = pairs
            .iter()
            .filter(|p| p.private_key.as_deref().is_some_and(|k| !k.is_empty()))
            .collect();
        if usable.is_empty() {
            debug!(workspace_id = %identity.workspace_id, "no vcs ssh keys to mount");
            return Ok(());
        }

        let labels = BTreeMap::from([(
            WORKSPACE_ID_LABEL.to_string(),
            identity.workspace_id.clone(),
        )]);
        let secret_name = format!("{}-sshprivatekeys", identity.workspace_id);
        let config_name = format!("{}-sshconfigmap", identity.workspace_id);

        env.add_secret(Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            string_data: Some(
                usable
                    .iter()
                    .filter_map(|p| Some((key_file_name(p), p.private_key.clone()?)))
                    .collect(),
            ),
            ..Default::default()
        })?;
        env.add_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_name.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                SSH_CONFIG_KEY.to_string(),
                render_ssh_config(&usable),
            )])),
            ..Default::default()
        })?;

        for template in env.pod_templates_mut() {
            if template.role == PodRole::Injectable {
                continue;
            }
            let volumes = template.spec.volumes.get_or_insert_with(Vec::new);
            volumes.push(Volume {
                name: SSH_KEYS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    default_mode: Some(PRIVATE_KEY_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volumes.push(Volume {
                name: SSH_CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            for container in template.spec.containers.iter_mut() {
                let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                mounts.push(VolumeMount {
                    name: SSH_KEYS_VOLUME.to_string(),
                    mount_path: SSH_PRIVATE_KEYS_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
                mounts.push(VolumeMount {
                    name: SSH_CONFIG_VOLUME.to_string(),
                    mount_path: SSH_CONFIG_PATH.to_string(),
                    sub_path: Some(SSH_CONFIG_KEY.to_string()),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }

        debug!(
            workspace_id = %identity.workspace_id,
            keys = usable.len(),
            "vcs ssh keys mounted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PodData;
    use crate::stores::MockSshKeyStore;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kubews_common::Error;
    use mockall::predicate::eq;

    fn env_with_pods() -> KubernetesEnvironment {
        let mut env = KubernetesEnvironment::default();
        for (name, role) in [("app", PodRole::Deployment), ("sidecar", PodRole::Injectable)] {
            env.add_pod(PodData::new(
                ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                role,
            ))
            .unwrap();
        }
        env
    }

    fn pair(name: &str, private_key: Option<&str>) -> SshPair {
        SshPair {
            service: VCS_SSH_SERVICE.to_string(),
            name: name.to_string(),
            public_key: "ssh-rsa AAAA".to_string(),
            private_key: private_key.map(str::to_string),
        }
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws1", "default", "owner", "ns")
    }

    #[tokio::test]
    async fn keys_are_mounted_into_deployment_pods_only() {
        let mut keys = MockSshKeyStore::new();
        keys.expect_get_pairs()
            .with(eq("owner"), eq(VCS_SSH_SERVICE))
            .returning(|_, _| {
                Ok(vec![
                    pair("github.com", Some("PRIVATE")),
                    pair("no-private", None),
                ])
            });

        let mut env = env_with_pods();
        SshKeysProvisioner::new(Arc::new(keys))
            .provision(&mut env, &identity())
            .await
            .unwrap();

        let secret = &env.secrets["ws1-sshprivatekeys"];
        let data = secret.string_data.as_ref().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["github-com"], "PRIVATE");

        let config = &env.config_maps["ws1-sshconfigmap"].data.as_ref().unwrap()[SSH_CONFIG_KEY];
        assert!(config.contains("host github.com\nIdentityFile /etc/ssh/private/github-com"));
        assert!(!config.contains("no-private"));

        let app = &env.pods["app"].spec;
        assert_eq!(app.volumes.as_ref().unwrap().len(), 2);
        assert_eq!(app.containers[0].volume_mounts.as_ref().unwrap().len(), 2);
        assert!(env.pods["sidecar"].spec.volumes.is_none());
    }

    #[tokio::test]
    async fn store_failure_is_a_warning() {
        let mut keys = MockSshKeyStore::new();
        keys.expect_get_pairs()
            .returning(|_, _| Err(Error::store("ssh", "unreachable")));

        let mut env = env_with_pods();
        SshKeysProvisioner::new(Arc::new(keys))
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert_eq!(env.warnings.len(), 1);
        assert_eq!(env.warnings[0].code, warnings::NOT_ABLE_TO_PROVISION_SSH_KEYS);
        assert!(env.secrets.is_empty());
    }

    #[tokio::test]
    async fn no_keys_no_objects() {
        let mut keys = MockSshKeyStore::new();
        keys.expect_get_pairs().returning(|_, _| Ok(vec![]));

        let mut env = env_with_pods();
        SshKeysProvisioner::new(Arc::new(keys))
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert!(env.secrets.is_empty());
        assert!(env.config_maps.is_empty());
        assert!(env.warnings.is_empty());
    }
}
