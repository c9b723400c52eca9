//! Ordered execution of provisioners over a workspace environment
//!
//! Provisioners run strictly in registration order. A provisioner may mutate
//! the environment or record warnings on it; an error aborts the run
//! immediately and propagates unchanged. Nothing is rolled back: the caller
//! discards the environment on failure.

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

use kubews_common::Result;

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;

/// One transformation step of a workspace start
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Apply the step to `env`
    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()>;
}

/// Provisioners in execution order
#[derive(Default)]
pub struct ProvisionerPipeline {
    steps: Vec<Box<dyn Provisioner>>,
}

impl ProvisionerPipeline {
    /// Empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn with(mut self, step: impl Provisioner + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append an already boxed step
    pub fn push(&mut self, step: Box<dyn Provisioner>) {
        self.steps.push(step);
    }

    /// Step names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first error
    pub async fn run(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        for step in &self.steps {
            let warnings_before = env.warnings.len();
            debug!(
                provisioner = step.name(),
                workspace_id = %identity.workspace_id,
                "running provisioner"
            );
            if let Err(e) = step.provision(env, identity).await {
                warn!(
                    provisioner = step.name(),
                    workspace_id = %identity.workspace_id,
                    error = %e,
                    "provisioner failed, aborting start"
                );
                return Err(e);
            }
            for warning in &env.warnings[warnings_before..] {
                info!(
                    provisioner = step.name(),
                    workspace_id = %identity.workspace_id,
                    code = warning.code,
                    message = %warning.message,
                    "provisioner recorded warning"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubews_common::Error;
    use std::sync::{Arc, Mutex};

    /// Records provisioner invocations in order
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn push(&self, name: &str) {
            self.0.lock().unwrap().push(name.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws1", "default", "user1", "user1-che")
    }

    fn recording(name: &'static str, recorder: Arc<Recorder>, fail: bool) -> MockProvisioner {
        let mut step = MockProvisioner::new();
        step.expect_name().return_const(name.to_string());
        step.expect_provision().returning(move |env, _| {
            recorder.push(name);
            if fail {
                return Err(Error::validation(format!("{} rejected the workspace", name)));
            }
            env.warn(1, format!("{} ran", name));
            Ok(())
        });
        step
    }

    #[tokio::test]
    async fn empty_pipeline_leaves_environment_unchanged() {
        let mut env = KubernetesEnvironment::default();
        ProvisionerPipeline::new()
            .run(&mut env, &identity())
            .await
            .unwrap();
        assert!(env.is_empty());
        assert!(env.warnings.is_empty());
    }

    #[tokio::test]
    async fn steps_run_in_registration_order() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = ProvisionerPipeline::new()
            .with(recording("first", recorder.clone(), false))
            .with(recording("second", recorder.clone(), false))
            .with(recording("third", recorder.clone(), false));

        let mut env = KubernetesEnvironment::default();
        pipeline.run(&mut env, &identity()).await.unwrap();

        assert_eq!(recorder.calls(), vec!["first", "second", "third"]);
        assert_eq!(pipeline.names(), vec!["first", "second", "third"]);
        assert_eq!(env.warnings.len(), 3);
    }

    #[tokio::test]
    async fn first_error_aborts_remaining_steps() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = ProvisionerPipeline::new()
            .with(recording("first", recorder.clone(), false))
            .with(recording("broken", recorder.clone(), true))
            .with(recording("never", recorder.clone(), false));

        let mut env = KubernetesEnvironment::default();
        let err = pipeline.run(&mut env, &identity()).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("broken rejected the workspace"));
        assert_eq!(recorder.calls(), vec!["first", "broken"]);
        // Earlier mutations are not rolled back
        assert_eq!(env.warnings.len(), 1);
    }
}
