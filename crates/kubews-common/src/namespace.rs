//! Operations on the objects of one workspace namespace
//!
//! [`NamespaceOps`] is the seam between provisioning logic and the Kubernetes
//! API. [`KubeNamespaceOps`] implements it with kube-rs; tests use the mockall
//! mock (exported to other crates behind the `test-support` feature).

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(any(test, feature = "test-support"))]
use mockall::automock;

use crate::kube_utils::resource_key;
use crate::watch::{DeleteOutcome, ObjectWatch, WatchSignal};
use crate::{Error, Result};

/// Trait abstracting the namespace-scoped Kubernetes calls kubews makes
#[cfg_attr(any(test, feature = "test-support"), automock)]
#[async_trait]
pub trait NamespaceOps: Send + Sync {
    /// Get a pod, `None` if absent
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Create a bare pod
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<()>;

    /// Delete a pod without waiting for its removal
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;

    /// Get a deployment, `None` if absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a deployment
    async fn create_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()>;

    /// Delete a deployment, cascading to its pods in the foreground
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;

    /// Subscribe to the events of one deployment.
    ///
    /// The returned watch is established: events that happen after this call
    /// returns are delivered.
    async fn watch_deployment(&self, namespace: &str, name: &str) -> Result<ObjectWatch>;

    /// Get a config map, `None` if absent
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a config map
    async fn create_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()>;

    /// Get a persistent volume claim, `None` if absent
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a persistent volume claim
    async fn create_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()>;

    /// Get a service, `None` if absent
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: Service) -> Result<()>;

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<()>;

    /// List secrets matching a label selector
    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;

    /// Create an ingress
    async fn create_ingress(&self, namespace: &str, ingress: Ingress) -> Result<()>;

    /// List every ingress of the namespace
    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>>;
}

/// kube-rs implementation of [`NamespaceOps`]
#[derive(Clone)]
pub struct KubeNamespaceOps {
    client: Client,
}

impl KubeNamespaceOps {
    /// Create a new implementation over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_opt<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<DeleteOutcome>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
        Err(e) => Err(e.into()),
    }
}

fn describe_deployment(deployment: &Deployment) -> String {
    let status = deployment.status.as_ref();
    let replicas = status.and_then(|s| s.replicas).unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let terminating = deployment.metadata.deletion_timestamp.is_some();
    format!(
        "replicas={} ready={}{}",
        replicas,
        ready,
        if terminating { " terminating" } else { "" }
    )
}

#[async_trait]
impl NamespaceOps for KubeNamespaceOps {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        get_opt(&self.api::<Pod>(namespace), name).await
    }

    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<()> {
        self.api::<Pod>(namespace)
            .create(&PostParams::default(), &pod)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        delete_opt(&self.api::<Pod>(namespace), name, &DeleteParams::default()).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(&self.api::<Deployment>(namespace), name).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()> {
        self.api::<Deployment>(namespace)
            .create(&PostParams::default(), &deployment)
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        // Foreground: the deployment disappears only after its pods are gone
        delete_opt(
            &self.api::<Deployment>(namespace),
            name,
            &DeleteParams::foreground(),
        )
        .await
    }

    async fn watch_deployment(&self, namespace: &str, name: &str) -> Result<ObjectWatch> {
        let key = resource_key("deployment", namespace, name);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let mut events = watcher::watcher(self.api::<Deployment>(namespace), config).boxed();

        // Drain the initial listing so the watch is live before the caller deletes
        let mut present = false;
        loop {
            match events.try_next().await {
                Ok(Some(Event::InitApply(_))) => present = true,
                Ok(Some(Event::InitDone)) => break,
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(Error::infrastructure(
                        "watch_deployment",
                        format!("watch for {} ended during initial listing", key),
                    ))
                }
                Err(e) => return Err(Error::infrastructure("watch_deployment", e.to_string())),
            }
        }
        debug!(resource = %key, present, "deployment watch established");

        // A relist that no longer contains the object also means it is gone
        let mut relisted_present = false;
        let signals = events
            .filter_map(move |event| {
                let signal = match event {
                    Ok(Event::Delete(_)) => Some(WatchSignal::Deleted),
                    Ok(Event::Apply(d)) => Some(WatchSignal::Observed(describe_deployment(&d))),
                    Ok(Event::Init) => {
                        relisted_present = false;
                        None
                    }
                    Ok(Event::InitApply(d)) => {
                        relisted_present = true;
                        Some(WatchSignal::Observed(describe_deployment(&d)))
                    }
                    Ok(Event::InitDone) if !relisted_present => Some(WatchSignal::Deleted),
                    Ok(Event::InitDone) => None,
                    Err(e) => Some(WatchSignal::Failed(e.to_string())),
                };
                futures::future::ready(signal)
            })
            .boxed();

        let closed_key = key.clone();
        Ok(ObjectWatch::new(signals).on_close(move || {
            debug!(resource = %closed_key, "deployment watch closed");
        }))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        get_opt(&self.api::<ConfigMap>(namespace), name).await
    }

    async fn create_config_map(&self, namespace: &str, config_map: ConfigMap) -> Result<()> {
        self.api::<ConfigMap>(namespace)
            .create(&PostParams::default(), &config_map)
            .await?;
        Ok(())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        get_opt(&self.api::<PersistentVolumeClaim>(namespace), name).await
    }

    async fn create_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> Result<()> {
        self.api::<PersistentVolumeClaim>(namespace)
            .create(&PostParams::default(), &pvc)
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        get_opt(&self.api::<Service>(namespace), name).await
    }

    async fn create_service(&self, namespace: &str, service: Service) -> Result<()> {
        self.api::<Service>(namespace)
            .create(&PostParams::default(), &service)
            .await?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<()> {
        self.api::<Secret>(namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let list = self
            .api::<Secret>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn create_ingress(&self, namespace: &str, ingress: Ingress) -> Result<()> {
        self.api::<Ingress>(namespace)
            .create(&PostParams::default(), &ingress)
            .await?;
        Ok(())
    }

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>> {
        let list = self
            .api::<Ingress>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }
}
