//! Pre-start interception of the async storage pod
//!
//! The storage pod mounts the user's common claim. A workspace of the same
//! user mounting that claim must not run next to it, so before a persistent
//! workspace starts the storage Deployment is deleted and the start waits
//! until the deletion has been observed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use kubews_common::kube_utils::resource_key;
use kubews_common::watch::delete_and_wait;
use kubews_common::{NamespaceOps, Result, ASYNC_STORAGE, COMMON_PVC_STRATEGY, PERSIST_VOLUMES_ATTRIBUTE};
use kubews_environment::{KubernetesEnvironment, Provisioner, RuntimeIdentity};

use crate::config::AsyncStorageConfig;
use crate::legacy::delete_legacy_pod;

/// Removes the async storage Deployment before a persistent workspace starts
pub struct AsyncStoragePodInterceptor {
    ops: Arc<dyn NamespaceOps>,
    pvc_strategy: String,
    delete_timeout: Duration,
}

impl AsyncStoragePodInterceptor {
    /// Interceptor acting through `ops`
    pub fn new(config: &AsyncStorageConfig, ops: Arc<dyn NamespaceOps>) -> Self {
        Self {
            ops,
            pvc_strategy: config.pvc_strategy.clone(),
            delete_timeout: config.delete_timeout,
        }
    }
}

#[async_trait]
impl Provisioner for AsyncStoragePodInterceptor {
    fn name(&self) -> &str {
        "async-storage-interceptor"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        if self.pvc_strategy != COMMON_PVC_STRATEGY
            || env.attribute(PERSIST_VOLUMES_ATTRIBUTE) == Some("false")
        {
            return Ok(());
        }

        let namespace = identity.infrastructure_namespace.as_str();
        delete_legacy_pod(self.ops.as_ref(), namespace).await;

        if self.ops.get_deployment(namespace, ASYNC_STORAGE).await?.is_none() {
            return Ok(());
        }

        let resource = resource_key("deployment", namespace, ASYNC_STORAGE);
        info!(
            workspace_id = %identity.workspace_id,
            resource = %resource,
            "removing async storage before workspace start"
        );
        delete_and_wait(
            resource.clone(),
            self.ops.watch_deployment(namespace, ASYNC_STORAGE),
            self.ops.delete_deployment(namespace, ASYNC_STORAGE),
            self.delete_timeout,
        )
        .await
        .inspect_err(|e| {
            error!(
                workspace_id = %identity.workspace_id,
                resource = %resource,
                error = %e,
                "async storage was not removed"
            );
        })
    }
}
