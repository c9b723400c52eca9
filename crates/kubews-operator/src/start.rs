//! One workspace start: recipe, pipeline, submission

use tracing::{info, instrument, warn};

use kubews_common::yaml::to_yaml_string;
use kubews_common::{Error, Result};
use kubews_environment::submit::SubmitReport;
use kubews_environment::{
    load_recipe, to_objects, ProvisionerPipeline, RuntimeIdentity, Submitter, Warning,
};

/// What a start produced
#[derive(Debug)]
pub struct StartOutcome {
    /// Non-fatal problems found while provisioning
    pub warnings: Vec<Warning>,
    /// Created objects, unless this was a dry run
    pub submitted: Option<SubmitReport>,
    /// Rendered manifests, for dry runs
    pub manifests: Option<String>,
}

/// Load `recipe`, run `pipeline` over it and submit the result, or render it
/// when `submitter` is `None`
///
/// A failing step aborts the start before anything of the workspace itself is
/// created.
#[instrument(skip_all, fields(workspace_id = %identity.workspace_id))]
pub async fn start_workspace(
    recipe: &str,
    identity: &RuntimeIdentity,
    pipeline: &ProvisionerPipeline,
    submitter: Option<&Submitter>,
) -> Result<StartOutcome> {
    let mut env = load_recipe(recipe)?;
    pipeline.run(&mut env, identity).await?;

    for warning in &env.warnings {
        warn!(code = warning.code, message = %warning.message, "workspace start warning");
    }

    let outcome = match submitter {
        Some(submitter) => {
            let report = submitter
                .submit(&env, &identity.infrastructure_namespace)
                .await?;
            info!(objects = report.total(), "workspace objects created");
            StartOutcome {
                warnings: env.warnings,
                submitted: Some(report),
                manifests: None,
            }
        }
        None => {
            let mut rendered = String::new();
            for object in to_objects(&env)? {
                let doc = to_yaml_string(&object)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                rendered.push_str(&doc);
                rendered.push('\n');
            }
            StartOutcome {
                warnings: env.warnings,
                submitted: None,
                manifests: Some(rendered),
            }
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kubews_common::MockNamespaceOps;
    use kubews_environment::provision::unique_names::unique_resource_name;
    use kubews_environment::provision::{
        EnvVarsProvisioner, UniqueNamesProvisioner, WorkspaceLabelsProvisioner,
    };
    use kubews_environment::{KubernetesEnvironment, Provisioner};
    use serde_json::Value;
    use std::sync::Arc;

    const RECIPE: &str = r#"
kind: ConfigMap
metadata:
  name: settings
---
kind: Pod
metadata:
  name: app
spec:
  containers:
    - name: main
      image: busybox
      envFrom:
        - configMapRef:
            name: settings
"#;

    const EXPOSED_RECIPE: &str = r#"
kind: ConfigMap
metadata:
  name: settings
---
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 8080
---
kind: Ingress
metadata:
  name: web
spec:
  rules:
    - host: web.example.com
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: web
                port:
                  number: 8080
---
kind: Pod
metadata:
  name: app
spec:
  containers:
    - name: main
      image: busybox
      env:
        - name: LEVEL
          valueFrom:
            configMapKeyRef:
              name: settings
              key: level
  volumes:
    - name: conf
      configMap:
        name: settings
"#;

    struct Failing;

    #[async_trait]
    impl Provisioner for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn provision(
            &self,
            _env: &mut KubernetesEnvironment,
            _identity: &RuntimeIdentity,
        ) -> Result<()> {
            Err(Error::validation("broken recipe"))
        }
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws1", "default", "u1", "alice-che")
    }

    #[tokio::test]
    async fn dry_run_renders_renamed_objects() {
        let pipeline = ProvisionerPipeline::new().with(UniqueNamesProvisioner);
        let outcome = start_workspace(RECIPE, &identity(), &pipeline, None)
            .await
            .unwrap();

        let manifests = outcome.manifests.unwrap();
        assert!(outcome.submitted.is_none());
        assert!(manifests.contains("kind: ConfigMap"));
        assert!(manifests.contains("kind: Deployment"));
        let renamed = unique_resource_name("settings", "ws1");
        assert!(manifests.contains(&format!("name: {}", renamed)));
        assert!(manifests.contains("che.original_name: settings"));
    }

    async fn provisioned_objects(pipeline: &ProvisionerPipeline) -> (Vec<Value>, usize) {
        let mut env = load_recipe(EXPOSED_RECIPE).unwrap();
        pipeline.run(&mut env, &identity()).await.unwrap();
        let (ingresses, rest): (Vec<Value>, Vec<Value>) = to_objects(&env)
            .unwrap()
            .into_iter()
            .partition(|o| o["kind"] == "Ingress");
        (rest, ingresses.len())
    }

    #[tokio::test]
    async fn same_recipe_and_identity_give_the_same_objects() {
        let pipeline = ProvisionerPipeline::new()
            .with(EnvVarsProvisioner)
            .with(WorkspaceLabelsProvisioner)
            .with(UniqueNamesProvisioner);

        let (first, first_ingresses) = provisioned_objects(&pipeline).await;
        let (second, second_ingresses) = provisioned_objects(&pipeline).await;

        assert_eq!(first, second);
        assert_eq!(first_ingresses, 1);
        assert_eq!(second_ingresses, 1);
        let renamed = unique_resource_name("settings", "ws1");
        assert!(first
            .iter()
            .any(|o| o["kind"] == "ConfigMap" && o["metadata"]["name"] == renamed.as_str()));
    }

    #[tokio::test]
    async fn failing_step_submits_nothing() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_create_config_map().never();
        ops.expect_create_deployment().never();
        let submitter = Submitter::new(Arc::new(ops));

        let pipeline = ProvisionerPipeline::new().with(Failing);
        let err = start_workspace(RECIPE, &identity(), &pipeline, Some(&submitter))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken recipe"));
    }

    #[tokio::test]
    async fn submitted_start_reports_created_objects() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_create_config_map()
            .times(1)
            .returning(|_, _| Ok(()));
        ops.expect_create_deployment()
            .withf(|ns, _| ns == "alice-che")
            .times(1)
            .returning(|_, _| Ok(()));
        let submitter = Submitter::new(Arc::new(ops));

        let outcome = start_workspace(RECIPE, &identity(), &ProvisionerPipeline::new(), Some(&submitter))
            .await
            .unwrap();
        assert_eq!(outcome.submitted.unwrap().total(), 2);
        assert!(outcome.warnings.is_empty());
    }
}
