//! Pipeline steps
//!
//! Each module holds one [`Provisioner`](crate::pipeline::Provisioner). The
//! operator registers them in an explicit order; [`unique_names`] must come
//! last among the structural steps.

pub mod env_vars;
pub mod git_config;
pub mod labels;
pub mod pod_spec;
pub mod ports;
pub mod preview_url;
pub mod secrets;
pub mod ssh_keys;
pub mod tls;
pub mod unique_names;

pub use env_vars::EnvVarsProvisioner;
pub use git_config::GitConfigProvisioner;
pub use labels::WorkspaceLabelsProvisioner;
pub use pod_spec::{PodDefaults, PodSpecDefaultsProvisioner};
pub use ports::{InstallerServersPortProvisioner, PortRange};
pub use preview_url::{ExposureStrategy, IngressExposureStrategy, PreviewUrlCommandsProvisioner};
pub use secrets::SecretAsContainerResourceProvisioner;
pub use ssh_keys::SshKeysProvisioner;
pub use tls::{IngressTlsProvisioner, TlsConfig};
pub use unique_names::UniqueNamesProvisioner;
