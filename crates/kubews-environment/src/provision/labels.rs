//! Workspace id label on every object

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kubews_common::{Result, WORKSPACE_ID_LABEL};

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;
use crate::pipeline::Provisioner;

fn label(meta: &mut ObjectMeta, workspace_id: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(WORKSPACE_ID_LABEL.to_string(), workspace_id.to_string());
}

/// Labels objects and pod templates with `che.workspace_id`
pub struct WorkspaceLabelsProvisioner;

#[async_trait]
impl Provisioner for WorkspaceLabelsProvisioner {
    fn name(&self) -> &str {
        "workspace-labels"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let id = identity.workspace_id.as_str();
        for template in env.pod_templates_mut() {
            label(template.metadata, id);
        }
        env.deployments
            .values_mut()
            .for_each(|o| label(&mut o.metadata, id));
        env.services
            .values_mut()
            .for_each(|o| label(&mut o.metadata, id));
        env.config_maps
            .values_mut()
            .for_each(|o| label(&mut o.metadata, id));
        env.secrets
            .values_mut()
            .for_each(|o| label(&mut o.metadata, id));
        env.ingresses
            .values_mut()
            .for_each(|o| label(&mut o.metadata, id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PodData, PodRole};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{ConfigMap, PodSpec};

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn every_object_and_template_is_labelled() {
        let mut env = KubernetesEnvironment::default();
        env.add_pod(PodData::new(meta("p"), PodSpec::default(), PodRole::Injectable))
            .unwrap();
        env.add_deployment(Deployment {
            metadata: meta("d"),
            spec: Some(DeploymentSpec::default()),
            ..Default::default()
        })
        .unwrap();
        env.add_config_map(ConfigMap {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([("keep".to_string(), "me".to_string())])),
                ..meta("cm")
            },
            ..Default::default()
        })
        .unwrap();

        WorkspaceLabelsProvisioner
            .provision(&mut env, &RuntimeIdentity::new("ws1", "d", "o", "ns"))
            .await
            .unwrap();

        let has_id = |m: &ObjectMeta| {
            m.labels.as_ref().and_then(|l| l.get(WORKSPACE_ID_LABEL)).map(String::as_str)
                == Some("ws1")
        };
        assert!(has_id(&env.pods["p"].metadata));
        assert!(has_id(&env.deployments["d"].metadata));
        let template = env.deployments["d"].spec.as_ref().unwrap().template.metadata.as_ref();
        assert!(has_id(template.unwrap()));
        let cm_labels = env.config_maps["cm"].metadata.labels.as_ref().unwrap();
        assert!(has_id(&env.config_maps["cm"].metadata));
        assert_eq!(cm_labels["keep"], "me");
    }
}
