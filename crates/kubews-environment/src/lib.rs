//! Workspace environment model and the provisioner pipeline that turns it
//! into the Kubernetes objects of one workspace start
//!
//! A start loads a recipe into a [`KubernetesEnvironment`], runs a
//! [`ProvisionerPipeline`] over it and submits the result with
//! [`submit::Submitter`].

#![deny(missing_docs)]

pub mod identity;
pub mod model;
pub mod pipeline;
pub mod provision;
pub mod recipe;
pub mod stores;
pub mod submit;
pub mod warnings;

pub use identity::RuntimeIdentity;
pub use model::{
    Command, InstallerConfig, KubernetesEnvironment, MachineConfig, PodData, PodRole, PreviewUrl,
    ServerConfig, Warning,
};
pub use pipeline::{Provisioner, ProvisionerPipeline};
pub use recipe::load_recipe;
pub use stores::{PreferenceStore, SshKeyStore, SshPair, User, UserDirectory, UserPage, WorkspaceRuntimes};
pub use submit::{to_objects, Submitter};

#[cfg(any(test, feature = "test-support"))]
pub use pipeline::MockProvisioner;
#[cfg(any(test, feature = "test-support"))]
pub use stores::{MockPreferenceStore, MockSshKeyStore, MockUserDirectory, MockWorkspaceRuntimes};
