//! Assembly of the workspace start pipeline

use std::sync::Arc;

use kubews_common::NamespaceOps;
use kubews_environment::provision::{
    EnvVarsProvisioner, GitConfigProvisioner, IngressExposureStrategy, IngressTlsProvisioner,
    InstallerServersPortProvisioner, PodDefaults, PodSpecDefaultsProvisioner, PortRange,
    PreviewUrlCommandsProvisioner, SecretAsContainerResourceProvisioner, SshKeysProvisioner,
    TlsConfig, UniqueNamesProvisioner, WorkspaceLabelsProvisioner,
};
use kubews_environment::{
    PreferenceStore, ProvisionerPipeline, SshKeyStore, UserDirectory,
};
use kubews_storage::{AsyncStorageConfig, AsyncStoragePodInterceptor, AsyncStorageProvisioner};

/// Everything the pipeline steps talk to
#[derive(Clone)]
pub struct Collaborators {
    /// Namespace API
    pub ops: Arc<dyn NamespaceOps>,
    /// User preferences
    pub preferences: Arc<dyn PreferenceStore>,
    /// User accounts
    pub users: Arc<dyn UserDirectory>,
    /// SSH key pairs
    pub ssh: Arc<dyn SshKeyStore>,
}

/// Settings the pipeline steps are built from
#[derive(Clone, Debug, Default)]
pub struct PipelineSettings {
    /// Installer port range
    pub ports: PortRange,
    /// Pod spec defaults
    pub pod_defaults: PodDefaults,
    /// Ingress TLS
    pub tls: TlsConfig,
    /// Async storage
    pub storage: AsyncStorageConfig,
    /// Leave out steps that change the namespace while provisioning
    pub dry_run: bool,
}

/// Build the start pipeline
///
/// The async storage steps act on the namespace directly and come first, so
/// a start never runs next to the storage pod. Unique naming comes last: it
/// rewrites references every earlier step may have added.
pub fn build_pipeline(settings: &PipelineSettings, c: &Collaborators) -> ProvisionerPipeline {
    let mut pipeline = ProvisionerPipeline::new();

    if !settings.dry_run {
        pipeline.push(Box::new(AsyncStoragePodInterceptor::new(
            &settings.storage,
            c.ops.clone(),
        )));
        pipeline.push(Box::new(AsyncStorageProvisioner::new(
            settings.storage.clone(),
            c.ops.clone(),
            c.ssh.clone(),
        )));
    }

    pipeline
        .with(PodSpecDefaultsProvisioner::new(settings.pod_defaults.clone()))
        .with(InstallerServersPortProvisioner::new(settings.ports))
        .with(EnvVarsProvisioner)
        .with(GitConfigProvisioner::new(
            c.preferences.clone(),
            c.users.clone(),
        ))
        .with(SshKeysProvisioner::new(c.ssh.clone()))
        .with(SecretAsContainerResourceProvisioner::new(c.ops.clone()))
        .with(IngressTlsProvisioner::new(settings.tls.clone()))
        .with(PreviewUrlCommandsProvisioner::new(Arc::new(
            IngressExposureStrategy::new(c.ops.clone()),
        )))
        .with(WorkspaceLabelsProvisioner)
        .with(UniqueNamesProvisioner)
}
