//! Common types for kubews: errors, Kubernetes operations and utilities

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod namespace;
pub mod retry;
pub mod telemetry;
pub mod watch;
pub mod yaml;

pub use error::Error;
pub use namespace::{KubeNamespaceOps, NamespaceOps};
pub use watch::{DeleteCompletion, DeleteOutcome, ObjectWatch, WatchSignal};

#[cfg(any(test, feature = "test-support"))]
pub use namespace::MockNamespaceOps;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label carrying the workspace id on every object kubews creates
pub const WORKSPACE_ID_LABEL: &str = "che.workspace_id";

/// Label recording an object's name before it was made unique
pub const ORIGINAL_NAME_LABEL: &str = "che.original_name";

/// Name of the shared async storage Deployment, its Service and legacy bare pod
pub const ASYNC_STORAGE: &str = "async-storage";

/// Workspace attribute: `"false"` marks an ephemeral workspace
pub const PERSIST_VOLUMES_ATTRIBUTE: &str = "persistVolumes";

/// Workspace attribute: `"true"` requests asynchronous storage
pub const ASYNC_PERSIST_ATTRIBUTE: &str = "asyncPersist";

/// PVC strategy under which all workspaces of a user share one claim
pub const COMMON_PVC_STRATEGY: &str = "common";
