//! Cluster-wide pod spec defaults
//!
//! Values already set by the recipe are kept; only unset fields are filled in.
//! Tolerations are appended unless an identical one is already present.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodSecurityContext, Toleration};

use kubews_common::Result;

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;
use crate::pipeline::Provisioner;

/// Defaults applied to every pod template
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodDefaults {
    /// Service account for workspace pods
    pub service_account: Option<String>,
    /// Node selector merged into each pod
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations added to each pod
    pub tolerations: Vec<Toleration>,
    /// `securityContext.runAsUser`
    pub run_as_user: Option<i64>,
    /// `securityContext.fsGroup`
    pub fs_group: Option<i64>,
    /// `terminationGracePeriodSeconds`
    pub termination_grace_period_seconds: Option<i64>,
}

/// Applies [`PodDefaults`]
pub struct PodSpecDefaultsProvisioner {
    defaults: PodDefaults,
}

impl PodSpecDefaultsProvisioner {
    /// Provisioner applying `defaults`
    pub fn new(defaults: PodDefaults) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Provisioner for PodSpecDefaultsProvisioner {
    fn name(&self) -> &str {
        "pod-spec-defaults"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        _identity: &RuntimeIdentity,
    ) -> Result<()> {
        let d = &self.defaults;
        for template in env.pod_templates_mut() {
            let spec = template.spec;

            if spec.service_account_name.is_none() {
                spec.service_account_name = d.service_account.clone();
            }

            if !d.node_selector.is_empty() {
                let selector = spec.node_selector.get_or_insert_with(BTreeMap::new);
                for (key, value) in &d.node_selector {
                    selector.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }

            if !d.tolerations.is_empty() {
                let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
                for toleration in &d.tolerations {
                    if !tolerations.contains(toleration) {
                        tolerations.push(toleration.clone());
                    }
                }
            }

            if d.run_as_user.is_some() || d.fs_group.is_some() {
                let ctx = spec
                    .security_context
                    .get_or_insert_with(PodSecurityContext::default);
                if ctx.run_as_user.is_none() {
                    ctx.run_as_user = d.run_as_user;
                }
                if ctx.fs_group.is_none() {
                    ctx.fs_group = d.fs_group;
                }
            }

            if spec.termination_grace_period_seconds.is_none() {
                spec.termination_grace_period_seconds = d.termination_grace_period_seconds;
            }
        }
        Ok(())
    }
}
