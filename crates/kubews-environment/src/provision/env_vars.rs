//! Machine environment variables into containers

use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;

use kubews_common::Result;

use crate::identity::RuntimeIdentity;
use crate::model::{machine_name, KubernetesEnvironment};
use crate::pipeline::Provisioner;

/// Copies each machine's `env` into its container. Variables the container
/// already declares win.
pub struct EnvVarsProvisioner;

#[async_trait]
impl Provisioner for EnvVarsProvisioner {
    fn name(&self) -> &str {
        "env-vars"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        _identity: &RuntimeIdentity,
    ) -> Result<()> {
        let machines = &env.machines;
        let mut templates = Vec::new();
        // Borrow machines immutably while walking the pod templates mutably
        for (name, pod) in env.pods.iter_mut() {
            templates.push((name.as_str(), &mut pod.spec));
        }
        for (name, deployment) in env.deployments.iter_mut() {
            if let Some(spec) = deployment
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
            {
                templates.push((name.as_str(), spec));
            }
        }

        for (pod_name, spec) in templates {
            for container in spec.containers.iter_mut() {
                let Some(machine) = machines.get(&machine_name(pod_name, &container.name)) else {
                    continue;
                };
                let vars = container.env.get_or_insert_with(Vec::new);
                for (key, value) in &machine.env {
                    if vars.iter().any(|v| &v.name == key) {
                        continue;
                    }
                    vars.push(EnvVar {
                        name: key.clone(),
                        value: Some(value.clone()),
                        value_from: None,
                    });
                }
            }
        }
        Ok(())
    }
}
