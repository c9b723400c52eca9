//! TLS sections for workspace ingresses

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::IngressTLS;

use kubews_common::Result;

use crate::identity::RuntimeIdentity;
use crate::model::KubernetesEnvironment;
use crate::pipeline::Provisioner;

/// Ingress TLS settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Whether ingresses are served over TLS
    pub enabled: bool,
    /// Secret holding the certificate; the ingress controller default when unset
    pub secret_name: Option<String>,
}

/// Adds a `tls` entry covering every rule host of each ingress
pub struct IngressTlsProvisioner {
    config: TlsConfig,
}

impl IngressTlsProvisioner {
    /// Provisioner applying `config`
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provisioner for IngressTlsProvisioner {
    fn name(&self) -> &str {
        "ingress-tls"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        _identity: &RuntimeIdentity,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        for ingress in env.ingresses.values_mut() {
            let Some(spec) = ingress.spec.as_mut() else {
                continue;
            };
            let hosts: Vec<String> = spec
                .rules
                .iter()
                .flatten()
                .filter_map(|rule| rule.host.clone())
                .collect();
            if hosts.is_empty() {
                continue;
            }
            spec.tls = Some(vec![IngressTLS {
                hosts: Some(hosts),
                secret_name: self.config.secret_name.clone(),
            }]);
        }
        Ok(())
    }
}
