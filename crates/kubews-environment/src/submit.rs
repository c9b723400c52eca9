//! Submission of a finished environment to the namespace
//!
//! Objects are created in dependency order: secrets, config maps, services,
//! ingresses, deployments, then pods. Deployment-role pods are wrapped into
//! single-replica Deployments; injectable pods are created bare. Create calls
//! are retried on transient failures only.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::Resource;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use kubews_common::retry::{retry_with_backoff, RetryConfig};
use kubews_common::{Error, NamespaceOps, Result};

use crate::model::{KubernetesEnvironment, PodData, PodRole};

/// Pod label the wrapping Deployment selects on
pub const DEPLOYMENT_NAME_LABEL: &str = "deployment";

/// Wrap a pod into a single-replica Deployment with a `Recreate` strategy
pub fn deployment_for_pod(name: &str, pod: &PodData) -> Deployment {
    let mut template_meta = pod.metadata.clone();
    template_meta.name = None;
    template_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(DEPLOYMENT_NAME_LABEL.to_string(), name.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: pod.metadata.labels.clone(),
            annotations: pod.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    DEPLOYMENT_NAME_LABEL.to_string(),
                    name.to_string(),
                )])),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(template_meta),
                spec: Some(pod.spec.clone()),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bare_pod(pod: &PodData) -> Pod {
    Pod {
        metadata: pod.metadata.clone(),
        spec: Some(pod.spec.clone()),
        ..Default::default()
    }
}

/// Wrapped and bare workload objects derived from the environment's pods
fn pod_workloads(env: &KubernetesEnvironment) -> (Vec<Deployment>, Vec<Pod>) {
    let mut deployments = Vec::new();
    let mut pods = Vec::new();
    for (name, pod) in &env.pods {
        match pod.role() {
            PodRole::Deployment => deployments.push(deployment_for_pod(name, pod)),
            PodRole::Injectable => pods.push(bare_pod(pod)),
        }
    }
    (deployments, pods)
}

fn manifest<K: Resource + Serialize>(obj: &K) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Value::Object(map) = &mut value {
        map.insert("apiVersion".to_string(), Value::from(K::API_VERSION));
        map.insert("kind".to_string(), Value::from(K::KIND));
    }
    Ok(value)
}

/// Every object that submission would create, in creation order, as manifests
pub fn to_objects(env: &KubernetesEnvironment) -> Result<Vec<Value>> {
    let (wrapped, bare) = pod_workloads(env);
    let mut out = Vec::new();
    for o in env.secrets.values() {
        out.push(manifest(o)?);
    }
    for o in env.config_maps.values() {
        out.push(manifest(o)?);
    }
    for o in env.services.values() {
        out.push(manifest(o)?);
    }
    for o in env.ingresses.values() {
        out.push(manifest(o)?);
    }
    for o in env.deployments.values().chain(wrapped.iter()) {
        out.push(manifest(o)?);
    }
    for o in &bare {
        out.push(manifest(o)?);
    }
    Ok(out)
}

/// Counts of created objects
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Objects created, by kind
    pub created: BTreeMap<&'static str, usize>,
}

impl SubmitReport {
    fn record(&mut self, kind: &'static str) {
        *self.created.entry(kind).or_default() += 1;
    }

    /// Total number of objects created
    pub fn total(&self) -> usize {
        self.created.values().sum()
    }
}

/// Creates environment objects in a namespace
pub struct Submitter {
    ops: Arc<dyn NamespaceOps>,
    retry: RetryConfig,
}

impl Submitter {
    /// Submitter with default retry settings
    pub fn new(ops: Arc<dyn NamespaceOps>) -> Self {
        Self {
            ops,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry settings
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn create<T, F, Fut>(&self, kind: &'static str, name: &str, obj: T, create: F) -> Result<()>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let op = format!("create {} {}", kind, name);
        retry_with_backoff(&self.retry, &op, Error::is_transient, || create(obj.clone()))
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    Error::infrastructure(op.clone(), format!("{} '{}' already exists", kind, name))
                } else {
                    e
                }
            })
    }

    /// Create every object of `env` in `namespace`
    ///
    /// The first failure stops submission; objects already created stay.
    #[instrument(skip(self, env))]
    pub async fn submit(&self, env: &KubernetesEnvironment, namespace: &str) -> Result<SubmitReport> {
        let ops = &self.ops;
        let mut report = SubmitReport::default();

        for (name, o) in &env.secrets {
            self.create("Secret", name, o.clone(), |o| ops.create_secret(namespace, o))
                .await?;
            report.record("Secret");
        }
        for (name, o) in &env.config_maps {
            self.create("ConfigMap", name, o.clone(), |o| {
                ops.create_config_map(namespace, o)
            })
            .await?;
            report.record("ConfigMap");
        }
        for (name, o) in &env.services {
            self.create("Service", name, o.clone(), |o| ops.create_service(namespace, o))
                .await?;
            report.record("Service");
        }
        for (name, o) in &env.ingresses {
            self.create("Ingress", name, o.clone(), |o| ops.create_ingress(namespace, o))
                .await?;
            report.record("Ingress");
        }

        let (wrapped, bare) = pod_workloads(env);
        for o in env.deployments.values().chain(wrapped.iter()) {
            let name = o.metadata.name.clone().unwrap_or_default();
            self.create("Deployment", &name, o.clone(), |o| {
                ops.create_deployment(namespace, o)
            })
            .await?;
            report.record("Deployment");
        }
        for o in bare {
            let name = o.metadata.name.clone().unwrap_or_default();
            self.create("Pod", &name, o, |o| ops.create_pod(namespace, o))
                .await?;
            report.record("Pod");
        }

        info!(objects = report.total(), "environment submitted");
        Ok(report)
    }
}
