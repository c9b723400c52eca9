//! Git identity for workspace containers
//!
//! The identity comes from the IDE preferences (`git.user.name`,
//! `git.user.email`) and falls back to the user account. It is written to a
//! `gitconfig` config map mounted at `/etc/gitconfig` in every container of
//! Deployment-role pods. Store failures and malformed preferences are warnings:
//! a workspace without a git identity still starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tracing::debug;

use kubews_common::Result;

use crate::identity::RuntimeIdentity;
use crate::model::{KubernetesEnvironment, PodRole};
use crate::pipeline::Provisioner;
use crate::stores::{PreferenceStore, UserDirectory, USER_PREFERENCES_PREFERENCE};
use crate::warnings;

/// Config map and key holding the rendered git config
pub const GIT_CONFIG_MAP_NAME: &str = "gitconfig";
/// Volume name referencing the config map
pub const GIT_CONFIG_VOLUME: &str = "gitconfigvolume";
/// Where git looks for the system config
pub const GIT_CONFIG_PATH: &str = "/etc/gitconfig";

const NAME_PREFERENCE: &str = "git.user.name";
const EMAIL_PREFERENCE: &str = "git.user.email";

const USER_MANAGEMENT_FAILURE: &str =
    "Unable to provision git configuration into runtime. Internal server error occurred during operating with user management";

#[derive(Debug, Default, PartialEq, Eq)]
struct GitIdentity {
    name: Option<String>,
    email: Option<String>,
}

impl GitIdentity {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }

    fn render(&self) -> String {
        let mut out = String::from("[user]\n");
        if let Some(name) = &self.name {
            out.push_str(&format!("\tname = {}\n", name));
        }
        if let Some(email) = &self.email {
            out.push_str(&format!("\temail = {}\n", email));
        }
        out
    }
}

fn non_empty(s: impl Into<String>) -> Option<String> {
    Some(s.into()).filter(|s| !s.is_empty())
}

/// Only string values count; anything else is ignored
fn parse_preferences(json: &str) -> std::result::Result<GitIdentity, serde_json::Error> {
    let value: Value = serde_json::from_str(json)?;
    let field = |key: &str| value.get(key).and_then(Value::as_str).and_then(non_empty);
    Ok(GitIdentity {
        name: field(NAME_PREFERENCE),
        email: field(EMAIL_PREFERENCE),
    })
}

/// Mounts a git config with the owner's identity
pub struct GitConfigProvisioner {
    preferences: Arc<dyn PreferenceStore>,
    users: Arc<dyn UserDirectory>,
}

impl GitConfigProvisioner {
    /// Provisioner reading from the given stores
    pub fn new(preferences: Arc<dyn PreferenceStore>, users: Arc<dyn UserDirectory>) -> Self {
        Self { preferences, users }
    }

    /// `Ok(None)` when no identity is known; `Err` carries the warning to record
    async fn identity(
        &self,
        owner_id: &str,
    ) -> std::result::Result<Option<GitIdentity>, (u32, String)> {
        let prefs: BTreeMap<String, String> = self
            .preferences
            .find(owner_id)
            .await
            .map_err(|e| {
                (
                    warnings::EXCEPTION_IN_USER_MANAGEMENT_DURING_GIT_PROVISION,
                    format!("{}: {}", USER_MANAGEMENT_FAILURE, e),
                )
            })?;

        let mut identity = match prefs.get(USER_PREFERENCES_PREFERENCE) {
            Some(json) => parse_preferences(json).map_err(|e| {
                (
                    warnings::JSON_IS_NOT_A_VALID_REPRESENTATION,
                    format!("JSON with user preferences is not valid: {}", e),
                )
            })?,
            None => GitIdentity::default(),
        };

        if identity.is_empty() {
            let user = self.users.get_by_id(owner_id).await.map_err(|e| {
                (
                    warnings::EXCEPTION_IN_USER_MANAGEMENT_DURING_GIT_PROVISION,
                    format!("{}: {}", USER_MANAGEMENT_FAILURE, e),
                )
            })?;
            identity = GitIdentity {
                name: non_empty(user.name),
                email: non_empty(user.email),
            };
        }

        Ok((!identity.is_empty()).then_some(identity))
    }
}

#[async_trait]
impl Provisioner for GitConfigProvisioner {
    fn name(&self) -> &str {
        "git-config"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let git = match self.identity(&identity.owner_id).await {
            Ok(Some(git)) => git,
            Ok(None) => {
                debug!(workspace_id = %identity.workspace_id, "no git identity known");
                return Ok(());
            }
            Err((code, message)) => {
                env.warn(code, message);
                return Ok(());
            }
        };

        env.add_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: Some(GIT_CONFIG_MAP_NAME.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                GIT_CONFIG_MAP_NAME.to_string(),
                git.render(),
            )])),
            ..Default::default()
        })?;

        for template in env.pod_templates_mut() {
            if template.role == PodRole::Injectable {
                continue;
            }
            template
                .spec
                .volumes
                .get_or_insert_with(Vec::new)
                .push(Volume {
                    name: GIT_CONFIG_VOLUME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: GIT_CONFIG_MAP_NAME.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            for container in template.spec.containers.iter_mut() {
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(VolumeMount {
                        name: GIT_CONFIG_VOLUME.to_string(),
                        mount_path: GIT_CONFIG_PATH.to_string(),
                        sub_path: Some(GIT_CONFIG_MAP_NAME.to_string()),
                        read_only: Some(false),
                        ..Default::default()
                    });
            }
        }
        Ok(())
    }
}
