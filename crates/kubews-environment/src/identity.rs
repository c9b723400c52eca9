//! Identity of the workspace runtime being started

use serde::{Deserialize, Serialize};

/// Who and where a workspace start is for
///
/// Passed explicitly to every provisioner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeIdentity {
    /// Workspace id, e.g. `workspace7b8jgqbkhbdb0de6`
    pub workspace_id: String,
    /// Name of the environment inside the workspace
    pub env_name: String,
    /// Id of the user owning the workspace
    pub owner_id: String,
    /// Namespace the workspace objects are created in
    pub infrastructure_namespace: String,
}

impl RuntimeIdentity {
    /// Create an identity
    pub fn new(
        workspace_id: impl Into<String>,
        env_name: impl Into<String>,
        owner_id: impl Into<String>,
        infrastructure_namespace: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            env_name: env_name.into(),
            owner_id: owner_id.into(),
            infrastructure_namespace: infrastructure_namespace.into(),
        }
    }
}
