//! In-memory object graph for one workspace start
//!
//! Every collection is keyed by object name, so names are unique per kind at
//! all times. The graph is mutated in place by each provisioner and handed to
//! submission once the pipeline finishes.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use kubews_common::{Error, Result};

/// What owns a pod's lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodRole {
    /// Submitted wrapped in a single-replica Deployment
    Deployment,
    /// Injected into an existing lifecycle; must not receive Deployment-only volumes
    Injectable,
}

/// A pod to be created, with the role it was declared with
#[derive(Clone, Debug, PartialEq)]
pub struct PodData {
    /// Pod metadata
    pub metadata: ObjectMeta,
    /// Pod spec
    pub spec: PodSpec,
    role: PodRole,
}

impl PodData {
    /// Create pod data; the role is fixed for the pod's lifetime
    pub fn new(metadata: ObjectMeta, spec: PodSpec, role: PodRole) -> Self {
        Self {
            metadata,
            spec,
            role,
        }
    }

    /// The role the pod was declared with
    pub fn role(&self) -> PodRole {
        self.role
    }
}

/// Mutable view of a pod template, whether from a bare pod or a Deployment
pub struct PodTemplateMut<'a> {
    /// Key of the owning object in its collection
    pub name: &'a str,
    /// Role of the pod
    pub role: PodRole,
    /// Pod (template) metadata
    pub metadata: &'a mut ObjectMeta,
    /// Pod (template) spec
    pub spec: &'a mut PodSpec,
}

/// A server exposed by a machine or an installer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// `"<port>"` or `"<port>/<transport>"`, e.g. `"8080/tcp"`
    pub port: String,
    /// URL scheme (http, ws, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// URL path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Free-form attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Numeric part of [`port`](Self::port), if it parses
    pub fn port_number(&self) -> Option<u16> {
        self.port.split('/').next()?.trim().parse().ok()
    }

    /// Replace the port number, keeping any `/<transport>` suffix
    pub fn set_port_number(&mut self, port: u16) {
        self.port = match self.port.split_once('/') {
            Some((_, transport)) => format!("{}/{}", port, transport),
            None => port.to_string(),
        };
    }
}

/// A tool installed into a machine, with the servers it starts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerConfig {
    /// Installer identifier, e.g. `org.eclipse.che.terminal`
    pub id: String,
    /// Servers keyed by server name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Runtime configuration of one container, keyed `<pod>/<container>`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    /// Environment variables to inject into the container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Servers keyed by server name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    /// Installers, in declaration order
    #[serde(default)]
    pub installers: Vec<InstallerConfig>,
    /// Free-form attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Machine name for a container of a pod
pub fn machine_name(pod: &str, container: &str) -> String {
    format!("{}/{}", pod, container)
}

/// Port and path a command wants exposed as a preview
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUrl {
    /// Container port to expose
    pub port: i32,
    /// Path appended to the resolved URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A workspace command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Command name
    pub name: String,
    /// Shell command line
    pub command_line: String,
    /// Optional preview
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<PreviewUrl>,
    /// Attributes; the resolved preview URL is written here
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Command attribute holding the resolved preview URL
pub const PREVIEW_URL_ATTRIBUTE: &str = "previewUrl";

/// Non-fatal problem found while provisioning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Stable numeric code
    pub code: u32,
    /// Human-readable description
    pub message: String,
}

impl Warning {
    /// Create a warning
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The object graph of one workspace start
#[derive(Clone, Debug, Default)]
pub struct KubernetesEnvironment {
    /// Bare pods keyed by name
    pub pods: BTreeMap<String, PodData>,
    /// Deployments keyed by name
    pub deployments: BTreeMap<String, Deployment>,
    /// Services keyed by name
    pub services: BTreeMap<String, Service>,
    /// Config maps keyed by name
    pub config_maps: BTreeMap<String, ConfigMap>,
    /// Secrets keyed by name
    pub secrets: BTreeMap<String, Secret>,
    /// Ingresses keyed by name
    pub ingresses: BTreeMap<String, Ingress>,
    /// Machine configuration keyed by `<pod>/<container>`
    pub machines: BTreeMap<String, MachineConfig>,
    /// Workspace commands
    pub commands: Vec<Command>,
    /// Accumulated non-fatal problems
    pub warnings: Vec<Warning>,
    /// Workspace attributes (`persistVolumes`, `asyncPersist`, ...)
    pub attributes: BTreeMap<String, String>,
}

fn insert_unique<T>(map: &mut BTreeMap<String, T>, kind: &str, name: String, obj: T) -> Result<()> {
    if map.contains_key(&name) {
        return Err(Error::validation(format!(
            "duplicate {} name '{}'",
            kind, name
        )));
    }
    map.insert(name, obj);
    Ok(())
}

fn object_name(kind: &str, meta: &ObjectMeta) -> Result<String> {
    meta.name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::validation(format!("{} without a name", kind)))
}

impl KubernetesEnvironment {
    /// Add a bare pod, rejecting duplicates
    pub fn add_pod(&mut self, pod: PodData) -> Result<()> {
        let name = object_name("Pod", &pod.metadata)?;
        insert_unique(&mut self.pods, "Pod", name, pod)
    }

    /// Add a deployment, rejecting duplicates
    pub fn add_deployment(&mut self, deployment: Deployment) -> Result<()> {
        let name = object_name("Deployment", &deployment.metadata)?;
        insert_unique(&mut self.deployments, "Deployment", name, deployment)
    }

    /// Add a service, rejecting duplicates
    pub fn add_service(&mut self, service: Service) -> Result<()> {
        let name = object_name("Service", &service.metadata)?;
        insert_unique(&mut self.services, "Service", name, service)
    }

    /// Add a config map, rejecting duplicates
    pub fn add_config_map(&mut self, config_map: ConfigMap) -> Result<()> {
        let name = object_name("ConfigMap", &config_map.metadata)?;
        insert_unique(&mut self.config_maps, "ConfigMap", name, config_map)
    }

    /// Add a secret, rejecting duplicates
    pub fn add_secret(&mut self, secret: Secret) -> Result<()> {
        let name = object_name("Secret", &secret.metadata)?;
        insert_unique(&mut self.secrets, "Secret", name, secret)
    }

    /// Add an ingress, rejecting duplicates
    pub fn add_ingress(&mut self, ingress: Ingress) -> Result<()> {
        let name = object_name("Ingress", &ingress.metadata)?;
        insert_unique(&mut self.ingresses, "Ingress", name, ingress)
    }

    /// Record a non-fatal problem
    pub fn warn(&mut self, code: u32, message: impl Into<String>) {
        self.warnings.push(Warning::new(code, message));
    }

    /// Attribute value, if set
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Every pod template: bare pods first, then Deployment templates
    ///
    /// Deployment templates always have the `Deployment` role.
    pub fn pod_templates_mut(&mut self) -> Vec<PodTemplateMut<'_>> {
        let mut templates = Vec::with_capacity(self.pods.len() + self.deployments.len());
        for (name, pod) in self.pods.iter_mut() {
            templates.push(PodTemplateMut {
                name,
                role: pod.role,
                metadata: &mut pod.metadata,
                spec: &mut pod.spec,
            });
        }
        for (name, deployment) in self.deployments.iter_mut() {
            let template = &mut deployment.spec.get_or_insert_with(Default::default).template;
            templates.push(PodTemplateMut {
                name,
                role: PodRole::Deployment,
                metadata: template.metadata.get_or_insert_with(Default::default),
                spec: template.spec.get_or_insert_with(Default::default),
            });
        }
        templates
    }

    /// Every pod template as `(name, role, spec)`, read-only
    pub fn pod_specs(&self) -> Vec<(&str, PodRole, &PodSpec)> {
        let pods = self
            .pods
            .iter()
            .map(|(name, pod)| (name.as_str(), pod.role, &pod.spec));
        let templates = self.deployments.iter().filter_map(|(name, d)| {
            d.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .map(|spec| (name.as_str(), PodRole::Deployment, spec))
        });
        pods.chain(templates).collect()
    }

    /// Whether the environment holds no objects at all
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
            && self.deployments.is_empty()
            && self.services.is_empty()
            && self.config_maps.is_empty()
            && self.secrets.is_empty()
            && self.ingresses.is_empty()
    }
}
