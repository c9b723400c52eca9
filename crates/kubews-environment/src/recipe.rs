//! Recipe loading
//!
//! A recipe is a multi-document YAML file of Kubernetes objects plus at most
//! one `WorkspaceConfig` document carrying attributes, machines and commands.
//! `List` documents are flattened into their items.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use kubews_common::yaml::parse_documents;
use kubews_common::{Error, Result};

use crate::model::{Command, KubernetesEnvironment, MachineConfig, PodData, PodRole};

/// Kind of the workspace configuration document
pub const WORKSPACE_CONFIG_KIND: &str = "WorkspaceConfig";

/// Pod annotation marking a pod as injectable rather than Deployment-owned
pub const INJECTABLE_ANNOTATION: &str = "kubews.io/injectable";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceConfigDocument {
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    machines: BTreeMap<String, MachineConfig>,
    #[serde(default)]
    commands: Vec<Command>,
}

fn typed<T: DeserializeOwned>(kind: &str, doc: Value) -> Result<T> {
    serde_json::from_value(doc).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

fn pod_data(pod: Pod) -> Result<PodData> {
    let injectable = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INJECTABLE_ANNOTATION))
        .is_some_and(|v| v == "true");
    let spec = pod.spec.ok_or_else(|| {
        Error::validation(format!(
            "Pod '{}' has no spec",
            pod.metadata.name.as_deref().unwrap_or_default()
        ))
    })?;
    let role = if injectable {
        PodRole::Injectable
    } else {
        PodRole::Deployment
    };
    Ok(PodData::new(pod.metadata, spec, role))
}

struct RecipeLoader {
    env: KubernetesEnvironment,
    seen_workspace_config: bool,
}

impl RecipeLoader {
    fn add(&mut self, doc: Value) -> Result<()> {
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("recipe document without 'kind'"))?
            .to_string();

        match kind.as_str() {
            "List" => {
                let items = match doc {
                    Value::Object(mut map) => map.remove("items"),
                    _ => None,
                };
                let Some(Value::Array(items)) = items else {
                    return Err(Error::validation("List document without 'items'"));
                };
                for item in items {
                    self.add(item)?;
                }
                Ok(())
            }
            "Pod" => self.env.add_pod(pod_data(typed::<Pod>(&kind, doc)?)?),
            "Deployment" => self.env.add_deployment(typed::<Deployment>(&kind, doc)?),
            "Service" => self.env.add_service(typed::<Service>(&kind, doc)?),
            "ConfigMap" => self.env.add_config_map(typed::<ConfigMap>(&kind, doc)?),
            "Secret" => self.env.add_secret(typed::<Secret>(&kind, doc)?),
            "Ingress" => self.env.add_ingress(typed::<Ingress>(&kind, doc)?),
            WORKSPACE_CONFIG_KIND => {
                if self.seen_workspace_config {
                    return Err(Error::validation(
                        "recipe contains more than one WorkspaceConfig document",
                    ));
                }
                self.seen_workspace_config = true;
                let config: WorkspaceConfigDocument = typed(&kind, doc)?;
                self.env.attributes.extend(config.attributes);
                self.env.machines.extend(config.machines);
                self.env.commands.extend(config.commands);
                Ok(())
            }
            other => Err(Error::validation(format!(
                "Found unknown object type in recipe -- name: '{}', kind: '{}'",
                doc.pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                other
            ))),
        }
    }
}

/// Build an environment from recipe YAML
pub fn load_recipe(content: &str) -> Result<KubernetesEnvironment> {
    let docs = parse_documents(content)
        .map_err(|e| Error::validation(format!("recipe is not valid YAML: {}", e)))?;

    let mut loader = RecipeLoader {
        env: KubernetesEnvironment::default(),
        seen_workspace_config: false,
    };
    for doc in docs {
        loader.add(doc)?;
    }

    let env = loader.env;
    debug!(
        pods = env.pods.len(),
        deployments = env.deployments.len(),
        services = env.services.len(),
        config_maps = env.config_maps.len(),
        secrets = env.secrets.len(),
        ingresses = env.ingresses.len(),
        machines = env.machines.len(),
        "recipe loaded"
    );
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  LOG_LEVEL: debug
---
apiVersion: v1
kind: Pod
metadata:
  name: app
spec:
  containers:
    - name: main
      image: quay.io/example/app:latest
      envFrom:
        - configMapRef:
            name: settings
---
apiVersion: v1
kind: Pod
metadata:
  name: tools
  annotations:
    kubews.io/injectable: "true"
spec:
  containers:
    - name: tools
      image: busybox
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
      targetPort: 3000
---
kind: WorkspaceConfig
attributes:
  persistVolumes: "true"
machines:
  app/main:
    env:
      MODE: dev
    installers:
      - id: org.eclipse.che.terminal
        servers:
          terminal:
            port: 4411/tcp
commands:
  - name: run
    commandLine: npm start
    previewUrl:
      port: 3000
      path: /
"#;

    #[test]
    fn recipe_populates_every_collection() {
        let env = load_recipe(RECIPE).unwrap();

        assert_eq!(env.config_maps.len(), 1);
        assert_eq!(env.services.len(), 1);
        assert_eq!(env.pods["app"].role(), PodRole::Deployment);
        assert_eq!(env.pods["tools"].role(), PodRole::Injectable);
        assert_eq!(env.attribute("persistVolumes"), Some("true"));

        let machine = &env.machines["app/main"];
        assert_eq!(machine.env["MODE"], "dev");
        assert_eq!(machine.installers[0].servers["terminal"].port, "4411/tcp");

        assert_eq!(env.commands.len(), 1);
        assert_eq!(env.commands[0].preview_url.as_ref().unwrap().port, 3000);
    }

    #[test]
    fn list_documents_are_flattened() {
        let env = load_recipe(
            r#"
kind: List
items:
  - kind: ConfigMap
    metadata:
      name: a
  - kind: ConfigMap
    metadata:
      name: b
"#,
        )
        .unwrap();
        assert_eq!(env.config_maps.len(), 2);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let err = load_recipe("kind: CronJob\nmetadata:\n  name: nightly\n").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("kind: 'CronJob'"));
        assert!(err.to_string().contains("name: 'nightly'"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = load_recipe(
            "kind: ConfigMap\nmetadata:\n  name: a\n---\nkind: ConfigMap\nmetadata:\n  name: a\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate ConfigMap name 'a'"));
    }

    #[test]
    fn second_workspace_config_is_rejected() {
        let err = load_recipe("kind: WorkspaceConfig\n---\nkind: WorkspaceConfig\n").unwrap_err();
        assert!(err.to_string().contains("more than one WorkspaceConfig"));
    }

    #[test]
    fn empty_recipe_is_an_empty_environment() {
        let env = load_recipe("# nothing here\n").unwrap();
        assert!(env.is_empty());
        assert!(env.warnings.is_empty());
    }
}
