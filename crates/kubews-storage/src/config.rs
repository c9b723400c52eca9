//! Async storage settings

use std::time::Duration;

use kubews_common::watch::DEFAULT_DELETE_TIMEOUT;
use kubews_common::COMMON_PVC_STRATEGY;

/// Namespace template placeholders that make a namespace per-user
pub const USER_NAMESPACE_PLACEHOLDERS: [&str; 2] = ["<username>", "<userid>"];

/// Settings for provisioning and intercepting the async storage pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsyncStorageConfig {
    /// Workspace PVC strategy (`common`, `per-workspace`, `unique`)
    pub pvc_strategy: String,
    /// Name of the claim shared by a user's workspaces
    pub pvc_name: String,
    /// Requested claim size, e.g. `10Gi`
    pub pvc_quantity: String,
    /// Claim access mode
    pub pvc_access_mode: String,
    /// Storage class; the cluster default when unset
    pub pvc_storage_class: Option<String>,
    /// Image of the storage pod
    pub image: String,
    /// Pull policy of the storage pod image
    pub image_pull_policy: String,
    /// How long a start waits for the storage Deployment to go away
    pub delete_timeout: Duration,
}

impl Default for AsyncStorageConfig {
    fn default() -> Self {
        Self {
            pvc_strategy: COMMON_PVC_STRATEGY.to_string(),
            pvc_name: "claim-che-workspace".to_string(),
            pvc_quantity: "10Gi".to_string(),
            pvc_access_mode: "ReadWriteOnce".to_string(),
            pvc_storage_class: None,
            image: "quay.io/eclipse/che-workspace-data-sync-storage:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
        }
    }
}

impl AsyncStorageConfig {
    /// Whether workspaces of a user share one claim
    pub fn is_common_strategy(&self) -> bool {
        self.pvc_strategy == COMMON_PVC_STRATEGY
    }
}

/// Settings for the idle reaper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Workspace PVC strategy
    pub pvc_strategy: String,
    /// Whether users may pick their own namespaces
    pub user_defined_namespaces: bool,
    /// Maximum running workspaces per user
    pub run_limit_per_user: u32,
    /// Template the infrastructure namespace is derived from
    pub namespace_template: String,
    /// Idle time after which a user's storage pod is removed; zero disables
    pub shutdown_timeout: Duration,
    /// Delay between sweeps
    pub period: Duration,
    /// Users fetched per directory page
    pub page_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pvc_strategy: COMMON_PVC_STRATEGY.to_string(),
            user_defined_namespaces: false,
            run_limit_per_user: 1,
            namespace_template: "<username>-che".to_string(),
            shutdown_timeout: Duration::from_secs(120 * 60),
            period: Duration::from_secs(30 * 60),
            page_size: 100,
        }
    }
}

impl ReaperConfig {
    /// Whether the reaper may run at all
    ///
    /// Only with one shared claim and namespace per user, one workspace at a
    /// time, and a positive shutdown timeout is an idle storage pod known to
    /// belong to nobody.
    pub fn is_enabled(&self) -> bool {
        !self.user_defined_namespaces
            && self.pvc_strategy == COMMON_PVC_STRATEGY
            && self.run_limit_per_user == 1
            && USER_NAMESPACE_PLACEHOLDERS
                .iter()
                .any(|p| self.namespace_template.contains(p))
            && !self.shutdown_timeout.is_zero()
    }
}
