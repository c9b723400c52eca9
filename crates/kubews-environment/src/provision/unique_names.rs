//! Workspace-unique object names
//!
//! Several workspaces of one user share a namespace, so every object name from
//! a recipe is made unique per workspace before submission. Config maps are
//! renamed first and a translation table built; only then are references to
//! them rewritten. References to config maps outside the environment are left
//! exactly as they were.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use kubews_common::kube_utils::{deterministic_hash, sanitize_dns_label};
use kubews_common::{Result, ORIGINAL_NAME_LABEL};

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;
use crate::pipeline::Provisioner;

const NAME_PREFIX_MAX: usize = 50;
const HASH_LEN: usize = 12;
const INGRESS_SUFFIX_LEN: usize = 8;

/// Name for `original` that is unique to `workspace_id`.
///
/// Deterministic: the same pair always yields the same name.
pub fn unique_resource_name(original: &str, workspace_id: &str) -> String {
    let hash = deterministic_hash(&format!("{}/{}", workspace_id, original));
    build_name(original, &hash)
}

/// Like [`unique_resource_name`], but distinct per object kind, so a pod and a
/// deployment declared with the same name do not collide once pods are
/// wrapped into deployments.
pub fn unique_kind_name(kind: &str, original: &str, workspace_id: &str) -> String {
    let hash = deterministic_hash(&format!("{}:{}/{}", kind, workspace_id, original));
    build_name(original, &hash)
}

fn build_name(original: &str, hash: &str) -> String {
    let prefix = sanitize_dns_label(original, NAME_PREFIX_MAX);
    let hash = &hash[..HASH_LEN];
    if prefix.is_empty() {
        format!("ws-{}", hash)
    } else {
        format!("{}-{}", prefix, hash)
    }
}

fn random_ingress_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INGRESS_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("ingress{}", suffix)
}

fn mark_renamed(meta: &mut ObjectMeta, original: &str, new_name: &str) {
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(ORIGINAL_NAME_LABEL.to_string(), original.to_string());
    meta.name = Some(new_name.to_string());
}

/// Renames pods, deployments, config maps and ingresses; runs last
pub struct UniqueNamesProvisioner;

impl UniqueNamesProvisioner {
    /// Build phase: rename config maps and return `original -> new`
    fn rename_config_maps(
        env: &mut KubernetesEnvironment,
        workspace_id: &str,
    ) -> BTreeMap<String, String> {
        let mut translation = BTreeMap::new();
        let config_maps = std::mem::take(&mut env.config_maps);
        for (original, mut config_map) in config_maps {
            let new_name = unique_resource_name(&original, workspace_id);
            mark_renamed(&mut config_map.metadata, &original, &new_name);
            env.config_maps.insert(new_name.clone(), config_map);
            translation.insert(original, new_name);
        }
        translation
    }

    fn rename_workloads(env: &mut KubernetesEnvironment, workspace_id: &str) {
        let pods = std::mem::take(&mut env.pods);
        for (original, mut pod) in pods {
            let new_name = unique_kind_name("pod", &original, workspace_id);
            mark_renamed(&mut pod.metadata, &original, &new_name);
            env.pods.insert(new_name, pod);
        }

        let deployments = std::mem::take(&mut env.deployments);
        for (original, mut deployment) in deployments {
            let new_name = unique_kind_name("deployment", &original, workspace_id);
            mark_renamed(&mut deployment.metadata, &original, &new_name);
            env.deployments.insert(new_name, deployment);
        }

        let ingresses = std::mem::take(&mut env.ingresses);
        for (original, mut ingress) in ingresses {
            let mut new_name = random_ingress_name();
            while env.ingresses.contains_key(&new_name) {
                new_name = random_ingress_name();
            }
            mark_renamed(&mut ingress.metadata, &original, &new_name);
            env.ingresses.insert(new_name, ingress);
        }
    }
}

/// Rewrite phase: point references at renamed config maps
pub fn rewrite_config_map_refs(spec: &mut PodSpec, translation: &BTreeMap<String, String>) {
    let containers = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten());
    for container in containers {
        rewrite_container(container, translation);
    }

    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(cm) = volume.config_map.as_mut() {
            if let Some(new_name) = translation.get(&cm.name) {
                cm.name = new_name.clone();
            }
        }
    }
}

fn rewrite_container(container: &mut Container, translation: &BTreeMap<String, String>) {
    for var in container.env.iter_mut().flatten() {
        let key_ref = var
            .value_from
            .as_mut()
            .and_then(|from| from.config_map_key_ref.as_mut());
        if let Some(key_ref) = key_ref {
            if let Some(new_name) = translation.get(&key_ref.name) {
                key_ref.name = new_name.clone();
            }
        }
    }
    for source in container.env_from.iter_mut().flatten() {
        if let Some(cm_ref) = source.config_map_ref.as_mut() {
            if let Some(new_name) = translation.get(&cm_ref.name) {
                cm_ref.name = new_name.clone();
            }
        }
    }
}

#[async_trait]
impl Provisioner for UniqueNamesProvisioner {
    fn name(&self) -> &str {
        "unique-names"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let workspace_id = identity.workspace_id.as_str();

        let translation = Self::rename_config_maps(env, workspace_id);
        Self::rename_workloads(env, workspace_id);

        for template in env.pod_templates_mut() {
            rewrite_config_map_refs(template.spec, &translation);
        }

        debug!(
            workspace_id,
            config_maps = translation.len(),
            pods = env.pods.len(),
            deployments = env.deployments.len(),
            "object names made unique"
        );
        Ok(())
    }
}
