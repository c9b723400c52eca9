//! Bare `async-storage` pods from before the storage pod moved into a Deployment

use kubews_common::{DeleteOutcome, NamespaceOps, ASYNC_STORAGE};
use tracing::{info, warn};

/// Delete the bare `async-storage` pod of `namespace` if it has no owner.
///
/// Pods owned by the storage Deployment's replica set are left to the
/// Deployment. Failures are logged and swallowed; returns whether a pod was
/// deleted.
pub async fn delete_legacy_pod(ops: &dyn NamespaceOps, namespace: &str) -> bool {
    let pod = match ops.get_pod(namespace, ASYNC_STORAGE).await {
        Ok(Some(pod)) => pod,
        Ok(None) => return false,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "failed to look up legacy storage pod");
            return false;
        }
    };

    let owned = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| !refs.is_empty());
    if owned {
        return false;
    }

    match ops.delete_pod(namespace, ASYNC_STORAGE).await {
        Ok(DeleteOutcome::Deleted) => {
            info!(namespace = %namespace, "legacy storage pod deleted");
            true
        }
        Ok(DeleteOutcome::NotFound) => false,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "failed to delete legacy storage pod");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kubews_common::{Error, MockNamespaceOps};

    fn pod(owners: Option<Vec<OwnerReference>>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(ASYNC_STORAGE.to_string()),
                owner_references: owners,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ownerless_pod_is_deleted() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_get_pod().returning(|_, _| Ok(Some(pod(None))));
        ops.expect_delete_pod()
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));

        assert!(delete_legacy_pod(&ops, "user-che").await);
    }

    #[tokio::test]
    async fn owned_pod_is_left_alone() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_get_pod().returning(|_, _| {
            Ok(Some(pod(Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: "async-storage-5d8f".to_string(),
                uid: "uid".to_string(),
                ..Default::default()
            }]))))
        });
        ops.expect_delete_pod().never();

        assert!(!delete_legacy_pod(&ops, "user-che").await);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_get_pod().returning(|_, _| Ok(Some(pod(Some(vec![])))));
        ops.expect_delete_pod()
            .returning(|_, _| Err(Error::internal("api down")));

        assert!(!delete_legacy_pod(&ops, "user-che").await);
    }
}
