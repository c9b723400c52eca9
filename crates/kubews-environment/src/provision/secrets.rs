//! User secrets mounted into workspace containers
//!
//! Secrets in the workspace namespace labelled as workspace secrets are exposed
//! to every container, either as environment variables or as files, depending
//! on their `che.eclipse.org/mount-as` annotation. Only secrets annotated with
//! `che.eclipse.org/automount-workspace-secret: "true"` are applied.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, Secret, SecretKeySelector, SecretVolumeSource,
    Volume, VolumeMount,
};
use tracing::debug;

use kubews_common::{Error, NamespaceOps, Result};

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;
use crate::pipeline::Provisioner;

/// Selects the secrets meant for workspaces
pub const WORKSPACE_SECRET_SELECTOR: &str =
    "app.kubernetes.io/part-of=che.eclipse.org,app.kubernetes.io/component=workspace-secret";

/// `env` or `file`
pub const ANNOTATION_MOUNT_AS: &str = "che.eclipse.org/mount-as";
/// Directory for `file` secrets
pub const ANNOTATION_MOUNT_PATH: &str = "che.eclipse.org/mount-path";
/// Variable name for a single-key `env` secret
pub const ANNOTATION_ENV_NAME: &str = "che.eclipse.org/env-name";
/// Must be `"true"` for the secret to be applied
pub const ANNOTATION_AUTOMOUNT: &str = "che.eclipse.org/automount-workspace-secret";

/// Per-key variable name annotation for multi-key `env` secrets
pub fn env_name_annotation(key: &str) -> String {
    format!("che.eclipse.org/{}_env-name", key)
}

#[derive(Debug, PartialEq, Eq)]
enum MountAs {
    Env,
    File,
}

fn annotation<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn secret_keys(secret: &Secret) -> BTreeSet<String> {
    let data = secret.data.iter().flat_map(|d| d.keys());
    let string_data = secret.string_data.iter().flat_map(|d| d.keys());
    data.chain(string_data).cloned().collect()
}

fn containers_mut(spec: &mut PodSpec) -> impl Iterator<Item = &mut Container> {
    spec.containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten())
}

/// Env variables the secret contributes
fn env_vars(name: &str, secret: &Secret) -> Result<Vec<EnvVar>> {
    let keys = secret_keys(secret);
    let single = keys.len() == 1;
    keys.iter()
        .map(|key| {
            let per_key = env_name_annotation(key);
            let env_name = annotation(secret, &per_key)
                .or_else(|| single.then(|| annotation(secret, ANNOTATION_ENV_NAME)).flatten())
                .ok_or_else(|| {
                    let expected = if single {
                        ANNOTATION_ENV_NAME
                    } else {
                        per_key.as_str()
                    };
                    Error::infrastructure(
                        "secrets",
                        format!(
                            "Unable to mount key '{}' of secret '{}': it is configured to be mounted as an environment variable, but its name was not specified. Please define the '{}' annotation on the secret to specify it.",
                            key, name, expected
                        ),
                    )
                })?;
            Ok(EnvVar {
                name: env_name.to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: name.to_string(),
                        key: key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            })
        })
        .collect()
}

fn apply_env(env: &mut KubernetesEnvironment, vars: &[EnvVar]) {
    for template in env.pod_templates_mut() {
        for container in containers_mut(template.spec) {
            let existing = container.env.get_or_insert_with(Vec::new);
            for var in vars {
                if !existing.iter().any(|v| v.name == var.name) {
                    existing.push(var.clone());
                }
            }
        }
    }
}

fn apply_files(env: &mut KubernetesEnvironment, name: &str, mount_path: &str, keys: &BTreeSet<String>) {
    let base = mount_path.trim_end_matches('/');
    for template in env.pod_templates_mut() {
        let volumes = template.spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == name) {
            volumes.push(Volume {
                name: name.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        for container in containers_mut(template.spec) {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            for key in keys {
                let path = format!("{}/{}", base, key);
                // A mount the recipe declared at the same path wins
                if mounts.iter().any(|m| m.mount_path == path) {
                    continue;
                }
                mounts.push(VolumeMount {
                    name: name.to_string(),
                    mount_path: path,
                    sub_path: Some(key.clone()),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }
    }
}

/// Applies workspace secrets found in the namespace
pub struct SecretAsContainerResourceProvisioner {
    ops: Arc<dyn NamespaceOps>,
}

impl SecretAsContainerResourceProvisioner {
    /// Provisioner listing secrets through `ops`
    pub fn new(ops: Arc<dyn NamespaceOps>) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl Provisioner for SecretAsContainerResourceProvisioner {
    fn name(&self) -> &str {
        "workspace-secrets"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let secrets = self
            .ops
            .list_secrets(&identity.infrastructure_namespace, WORKSPACE_SECRET_SELECTOR)
            .await?;

        for secret in &secrets {
            let name = secret.metadata.name.as_deref().unwrap_or_default();
            let mount_as = match annotation(secret, ANNOTATION_MOUNT_AS) {
                Some("env") => MountAs::Env,
                Some("file") => MountAs::File,
                _ => {
                    return Err(Error::infrastructure(
                        "secrets",
                        format!(
                            "Unable to mount secret '{}': it has missing or unknown type of the mount. Please make sure that '{}' annotation has value either 'env' or 'file'.",
                            name, ANNOTATION_MOUNT_AS
                        ),
                    ))
                }
            };

            if mount_as == MountAs::File && annotation(secret, ANNOTATION_MOUNT_PATH).is_none() {
                return Err(Error::infrastructure(
                    "secrets",
                    format!(
                        "Unable to mount secret '{}': it is configured to be mounted as a file but the mount path was not specified. Please define the '{}' annotation on the secret to specify it.",
                        name, ANNOTATION_MOUNT_PATH
                    ),
                ));
            }

            if annotation(secret, ANNOTATION_AUTOMOUNT) != Some("true") {
                debug!(secret = %name, "secret not marked for automount, skipping");
                continue;
            }

            match mount_as {
                MountAs::Env => {
                    let vars = env_vars(name, secret)?;
                    apply_env(env, &vars);
                }
                MountAs::File => {
                    let mount_path = annotation(secret, ANNOTATION_MOUNT_PATH).unwrap_or_default();
                    apply_files(env, name, mount_path, &secret_keys(secret));
                }
            }
            debug!(
                workspace_id = %identity.workspace_id,
                secret = %name,
                mount_as = ?mount_as,
                "workspace secret applied"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PodData, PodRole};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use kubews_common::MockNamespaceOps;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    fn env_with_pod() -> KubernetesEnvironment {
        let mut env = KubernetesEnvironment::default();
        env.add_pod(PodData::new(
            ObjectMeta {
                name: Some("pod1".to_string()),
                ..Default::default()
            },
            PodSpec {
                containers: ["maven", "other"]
                    .iter()
                    .map(|n| Container {
                        name: n.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
            PodRole::Deployment,
        ))
        .unwrap();
        env
    }

    fn secret(keys: &[&str], annotations: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("test_secret".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"random".to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn ops_returning(secret: Secret) -> Arc<MockNamespaceOps> {
        let mut ops = MockNamespaceOps::new();
        ops.expect_list_secrets()
            .with(eq("ns"), eq(WORKSPACE_SECRET_SELECTOR))
            .returning(move |_, _| Ok(vec![secret.clone()]));
        Arc::new(ops)
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws1", "default", "owner", "ns")
    }

    // ==========================================================================
    // Story: env secrets
    // ==========================================================================

    #[tokio::test]
    async fn single_key_env_secret_reaches_every_container() {
        let ops = ops_returning(secret(
            &["foo"],
            &[
                (ANNOTATION_ENV_NAME, "MY_FOO"),
                (ANNOTATION_MOUNT_AS, "env"),
                (ANNOTATION_AUTOMOUNT, "true"),
            ],
        ));
        let mut env = env_with_pod();

        SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap();

        for container in &env.pods["pod1"].spec.containers {
            let var = &container.env.as_ref().unwrap()[0];
            assert_eq!(var.name, "MY_FOO");
            let key_ref = var
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap();
            assert_eq!(key_ref.name, "test_secret");
            assert_eq!(key_ref.key, "foo");
        }
    }

    #[tokio::test]
    async fn multi_key_env_secret_uses_per_key_names() {
        let foo = env_name_annotation("foo");
        let bar = env_name_annotation("bar");
        let ops = ops_returning(secret(
            &["foo", "bar"],
            &[
                (foo.as_str(), "MY_FOO"),
                (bar.as_str(), "MY_BAR"),
                (ANNOTATION_MOUNT_AS, "env"),
                (ANNOTATION_AUTOMOUNT, "true"),
            ],
        ));
        let mut env = env_with_pod();

        SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap();

        let names: Vec<_> = env.pods["pod1"].spec.containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.clone())
            .collect();
        assert_eq!(names, vec!["MY_BAR", "MY_FOO"]);
    }

    #[tokio::test]
    async fn missing_env_name_is_fatal() {
        let ops = ops_returning(secret(
            &["foo", "bar"],
            &[(ANNOTATION_MOUNT_AS, "env"), (ANNOTATION_AUTOMOUNT, "true")],
        ));
        let mut env = env_with_pod();

        let err = SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("che.eclipse.org/bar_env-name"));
    }

    #[tokio::test]
    async fn secrets_without_automount_are_skipped() {
        let ops = ops_returning(secret(
            &["foo"],
            &[
                (ANNOTATION_ENV_NAME, "MY_FOO"),
                (ANNOTATION_MOUNT_AS, "env"),
                (ANNOTATION_AUTOMOUNT, "false"),
            ],
        ));
        let mut env = env_with_pod();

        SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert!(env.pods["pod1"].spec.containers[0].env.is_none());
    }

    #[tokio::test]
    async fn unknown_mount_type_is_fatal() {
        let ops = ops_returning(secret(&["foo"], &[]));
        let mut env = env_with_pod();

        let err = SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("missing or unknown type of the mount"));
    }

    // ==========================================================================
    // Story: file secrets
    // ==========================================================================

    #[tokio::test]
    async fn file_secret_mounts_each_key_read_only() {
        let ops = ops_returning(secret(
            &["settings.xml", "another.xml"],
            &[
                (ANNOTATION_MOUNT_AS, "file"),
                (ANNOTATION_MOUNT_PATH, "/home/user/.m2"),
                (ANNOTATION_AUTOMOUNT, "true"),
            ],
        ));
        let mut env = env_with_pod();

        SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap();

        let spec = &env.pods["pod1"].spec;
        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "test_secret");
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("test_secret")
        );

        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts.len(), 2);
            let paths: Vec<_> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
            assert_eq!(
                paths,
                vec!["/home/user/.m2/another.xml", "/home/user/.m2/settings.xml"]
            );
            assert!(mounts.iter().all(|m| m.read_only == Some(true)));
            assert_eq!(mounts[0].sub_path.as_deref(), Some("another.xml"));
        }
    }

    #[tokio::test]
    async fn existing_mount_at_same_path_is_kept() {
        let ops = ops_returning(secret(
            &["settings.xml"],
            &[
                (ANNOTATION_MOUNT_AS, "file"),
                (ANNOTATION_MOUNT_PATH, "/home/user/.m2/"),
                (ANNOTATION_AUTOMOUNT, "true"),
            ],
        ));
        let mut env = env_with_pod();
        env.pods.get_mut("pod1").unwrap().spec.containers[0].volume_mounts =
            Some(vec![VolumeMount {
                name: "own".to_string(),
                mount_path: "/home/user/.m2/settings.xml".to_string(),
                ..Default::default()
            }]);

        SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap();

        let mounts = env.pods["pod1"].spec.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "own");
    }

    #[tokio::test]
    async fn file_secret_without_path_is_fatal() {
        let ops = ops_returning(secret(&["settings.xml"], &[(ANNOTATION_MOUNT_AS, "file")]));
        let mut env = env_with_pod();

        let err = SecretAsContainerResourceProvisioner::new(ops)
            .provision(&mut env, &identity())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("the mount path was not specified"));
    }
}
