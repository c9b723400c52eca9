//! Preview URLs for workspace commands
//!
//! A command may ask for one of its container ports to be previewed. The port
//! is mapped to a service exposing it and the service to a host through the
//! platform's exposure objects; the resulting URL is written to the command's
//! `previewUrl` attribute. A port that cannot be resolved is a warning.
//!
//! How services are exposed differs per platform, so resolution goes through
//! [`ExposureStrategy`]. [`IngressExposureStrategy`] covers plain Kubernetes.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use kubews_common::{NamespaceOps, Result};

use crate::identity::RuntimeIdentity;
use crate::model::{KubernetesEnvironment, PREVIEW_URL_ATTRIBUTE};
use crate::pipeline::Provisioner;
use crate::warnings;

/// Objects a strategy needs to resolve hosts
#[derive(Clone, Debug, Default)]
pub struct ExposureObjects {
    /// Services that may expose a preview port
    pub services: Vec<Service>,
    /// Ingresses that may route to those services
    pub ingresses: Vec<Ingress>,
}

/// Resolved host of a service port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposedHost {
    /// Host name
    pub host: String,
    /// Path prefix the host routes to the service on
    pub path: String,
    /// Whether the host is served over TLS
    pub secure: bool,
}

/// Platform-specific resolution of service ports to public hosts
#[async_trait]
pub trait ExposureStrategy: Send + Sync {
    /// Gather the services and routing objects visible to the workspace
    async fn load_exposure_objects(
        &self,
        env: &KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<ExposureObjects>;

    /// Host that routes to `port` of `service`, if any
    fn find_host_for_service_port(
        &self,
        objects: &ExposureObjects,
        service: &Service,
        port: i32,
    ) -> Option<ExposedHost>;
}

/// Service whose ports include `container_port` as target (or as port, when
/// no target is set)
pub fn find_service_for_port(services: &[Service], container_port: i32) -> Option<(&Service, i32)> {
    services.iter().find_map(|service| {
        let ports = service.spec.as_ref()?.ports.as_ref()?;
        ports.iter().find_map(|p| {
            let target = match &p.target_port {
                Some(IntOrString::Int(t)) => *t,
                Some(IntOrString::String(_)) => return None,
                None => p.port,
            };
            (target == container_port).then_some((service, p.port))
        })
    })
}

/// Ingress routing for plain Kubernetes
pub struct IngressExposureStrategy {
    ops: Arc<dyn NamespaceOps>,
}

impl IngressExposureStrategy {
    /// Strategy that also considers ingresses already in the namespace
    pub fn new(ops: Arc<dyn NamespaceOps>) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl ExposureStrategy for IngressExposureStrategy {
    async fn load_exposure_objects(
        &self,
        env: &KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<ExposureObjects> {
        let mut ingresses: Vec<Ingress> = env.ingresses.values().cloned().collect();
        ingresses.extend(
            self.ops
                .list_ingresses(&identity.infrastructure_namespace)
                .await?,
        );
        Ok(ExposureObjects {
            services: env.services.values().cloned().collect(),
            ingresses,
        })
    }

    fn find_host_for_service_port(
        &self,
        objects: &ExposureObjects,
        service: &Service,
        port: i32,
    ) -> Option<ExposedHost> {
        let service_name = service.metadata.name.as_deref()?;
        objects.ingresses.iter().find_map(|ingress| {
            let spec = ingress.spec.as_ref()?;
            spec.rules.iter().flatten().find_map(|rule| {
                let host = rule.host.as_deref()?;
                let path = rule.http.as_ref()?.paths.iter().find(|p| {
                    p.backend.service.as_ref().is_some_and(|backend| {
                        backend.name == service_name
                            && backend
                                .port
                                .as_ref()
                                .and_then(|bp| bp.number)
                                .is_some_and(|n| n == port)
                    })
                })?;
                let secure = spec.tls.iter().flatten().any(|tls| {
                    tls.hosts
                        .iter()
                        .flatten()
                        .any(|h| h.as_str() == host)
                });
                Some(ExposedHost {
                    host: host.to_string(),
                    path: path.path.clone().unwrap_or_default(),
                    secure,
                })
            })
        })
    }
}

fn join_url(exposed: &ExposedHost, preview_path: Option<&str>) -> String {
    let scheme = if exposed.secure { "https" } else { "http" };
    let base = exposed.path.trim_end_matches('/');
    let tail = preview_path.unwrap_or_default().trim_start_matches('/');
    if tail.is_empty() {
        format!("{}://{}{}/", scheme, exposed.host, base)
    } else {
        format!("{}://{}{}/{}", scheme, exposed.host, base, tail)
    }
}

/// Resolves command preview URLs
pub struct PreviewUrlCommandsProvisioner {
    strategy: Arc<dyn ExposureStrategy>,
}

impl PreviewUrlCommandsProvisioner {
    /// Provisioner resolving hosts through `strategy`
    pub fn new(strategy: Arc<dyn ExposureStrategy>) -> Self {
        Self { strategy }
    }
}

#[async_trait]
impl Provisioner for PreviewUrlCommandsProvisioner {
    fn name(&self) -> &str {
        "preview-urls"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        if env.commands.iter().all(|c| c.preview_url.is_none()) {
            return Ok(());
        }

        let objects = self.strategy.load_exposure_objects(env, identity).await?;
        let mut problems = Vec::new();

        for command in env.commands.iter_mut() {
            let Some(preview) = command.preview_url.clone() else {
                continue;
            };
            let Some((service, service_port)) =
                find_service_for_port(&objects.services, preview.port)
            else {
                problems.push(format!(
                    "Not able to provision objects for PreviewUrl of command '{}'. Service with port `{}` not found.",
                    command.name, preview.port
                ));
                continue;
            };
            let Some(exposed) =
                self.strategy
                    .find_host_for_service_port(&objects, service, service_port)
            else {
                problems.push(format!(
                    "Not able to provision objects for PreviewUrl of command '{}'. Ingress for service `{}` and port `{}` not found.",
                    command.name,
                    service.metadata.name.as_deref().unwrap_or_default(),
                    service_port
                ));
                continue;
            };

            let url = join_url(&exposed, preview.path.as_deref());
            debug!(
                workspace_id = %identity.workspace_id,
                command = %command.name,
                url = %url,
                "preview url resolved"
            );
            command
                .attributes
                .insert(PREVIEW_URL_ATTRIBUTE.to_string(), url);
        }

        for message in problems {
            env.warn(warnings::NOT_ABLE_TO_PROVISION_OBJECTS_FOR_PREVIEW_URL, message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, PreviewUrl};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubews_common::MockNamespaceOps;
    use std::collections::BTreeMap;

    fn service(name: &str, port: i32, target: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(target)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress(name: &str, host: &str, service: &str, port: i32, tls: bool) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        name: None,
                                    }),
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                tls: tls.then(|| {
                    vec![IngressTLS {
                        hosts: Some(vec![host.to_string()]),
                        secret_name: None,
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn command(name: &str, port: i32, path: Option<&str>) -> Command {
        Command {
            name: name.to_string(),
            command_line: "npm start".to_string(),
            preview_url: Some(PreviewUrl {
                port,
                path: path.map(str::to_string),
            }),
            attributes: BTreeMap::new(),
        }
    }

    fn no_namespace_ingresses() -> Arc<MockNamespaceOps> {
        let mut ops = MockNamespaceOps::new();
        ops.expect_list_ingresses().returning(|_| Ok(vec![]));
        Arc::new(ops)
    }

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity::new("ws1", "default", "owner", "ns")
    }

    fn provisioner(ops: Arc<MockNamespaceOps>) -> PreviewUrlCommandsProvisioner {
        PreviewUrlCommandsProvisioner::new(Arc::new(IngressExposureStrategy::new(ops)))
    }

    #[test]
    fn service_is_found_by_target_port() {
        let services = vec![service("a", 80, 3000), service("b", 8080, 8080)];
        let (found, port) = find_service_for_port(&services, 3000).unwrap();
        assert_eq!(found.metadata.name.as_deref(), Some("a"));
        assert_eq!(port, 80);
        assert!(find_service_for_port(&services, 9999).is_none());
    }

    #[tokio::test]
    async fn resolved_preview_url_is_written_to_command() {
        let mut env = KubernetesEnvironment::default();
        env.add_service(service("web", 80, 3000)).unwrap();
        env.add_ingress(ingress("web-ing", "web.example.com", "web", 80, true))
            .unwrap();
        env.commands.push(command("run", 3000, Some("/app")));

        provisioner(no_namespace_ingresses())
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert_eq!(
            env.commands[0].attributes[PREVIEW_URL_ATTRIBUTE],
            "https://web.example.com/app"
        );
        assert!(env.warnings.is_empty());
    }

    #[tokio::test]
    async fn namespace_ingresses_are_considered() {
        let mut ops = MockNamespaceOps::new();
        ops.expect_list_ingresses()
            .returning(|_| Ok(vec![ingress("shared", "ws.example.com", "web", 80, false)]));

        let mut env = KubernetesEnvironment::default();
        env.add_service(service("web", 80, 3000)).unwrap();
        env.commands.push(command("run", 3000, None));

        provisioner(Arc::new(ops))
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert_eq!(
            env.commands[0].attributes[PREVIEW_URL_ATTRIBUTE],
            "http://ws.example.com/"
        );
    }

    #[tokio::test]
    async fn missing_service_or_ingress_is_a_warning() {
        let mut env = KubernetesEnvironment::default();
        env.add_service(service("web", 80, 3000)).unwrap();
        env.commands.push(command("no-service", 4000, None));
        env.commands.push(command("no-ingress", 3000, None));

        provisioner(no_namespace_ingresses())
            .provision(&mut env, &identity())
            .await
            .unwrap();

        assert_eq!(env.warnings.len(), 2);
        assert!(env
            .warnings
            .iter()
            .all(|w| w.code == warnings::NOT_ABLE_TO_PROVISION_OBJECTS_FOR_PREVIEW_URL));
        assert!(env.warnings[0].message.contains("Service with port `4000`"));
        assert!(env.warnings[1].message.contains("Ingress for service `web`"));
        assert!(env.commands.iter().all(|c| c.attributes.is_empty()));
    }

    #[tokio::test]
    async fn commands_without_preview_skip_loading() {
        let mut env = KubernetesEnvironment::default();
        env.commands.push(Command {
            name: "build".to_string(),
            command_line: "make".to_string(),
            preview_url: None,
            attributes: BTreeMap::new(),
        });

        // No expectations: any namespace call would panic
        provisioner(Arc::new(MockNamespaceOps::new()))
            .provision(&mut env, &identity())
            .await
            .unwrap();
    }
}
