//! Command line and environment configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Toleration;

use kubews_environment::provision::{PodDefaults, PortRange, TlsConfig};
use kubews_environment::RuntimeIdentity;
use kubews_storage::{AsyncStorageConfig, ReaperConfig};

/// kubews - turns workspace recipes into Kubernetes objects
#[derive(Parser, Debug)]
#[command(name = "kubews", version, about, long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Directory file backing users, preferences, ssh keys and runtime status
    #[arg(long, env = "KUBEWS_DIRECTORY", global = true)]
    pub directory: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "KUBEWS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// JSON lines
    Json,
    /// Human-readable
    Text,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision and submit one workspace
    Start(StartArgs),
    /// Periodically remove async storage of idle users
    Reaper(ReaperArgs),
}

/// Settings shared by the start path and the reaper
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Workspace PVC strategy
    #[arg(long, env = "KUBEWS_PVC_STRATEGY", default_value = "common")]
    pub pvc_strategy: String,

    /// Name of the common claim
    #[arg(long, env = "KUBEWS_PVC_NAME", default_value = "claim-che-workspace")]
    pub pvc_name: String,

    /// Size of the common claim
    #[arg(long, env = "KUBEWS_PVC_QUANTITY", default_value = "10Gi")]
    pub pvc_quantity: String,

    /// Access mode of the common claim
    #[arg(long, env = "KUBEWS_PVC_ACCESS_MODE", default_value = "ReadWriteOnce")]
    pub pvc_access_mode: String,

    /// Storage class of the common claim
    #[arg(long, env = "KUBEWS_PVC_STORAGE_CLASS")]
    pub pvc_storage_class: Option<String>,

    /// Image of the async storage pod
    #[arg(
        long,
        env = "KUBEWS_ASYNC_STORAGE_IMAGE",
        default_value = "quay.io/eclipse/che-workspace-data-sync-storage:latest"
    )]
    pub async_storage_image: String,

    /// Pull policy of the async storage image
    #[arg(long, env = "KUBEWS_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    pub image_pull_policy: String,

    /// Seconds a start waits for the async storage pod to go away
    #[arg(long, env = "KUBEWS_DELETE_TIMEOUT_SECS", default_value_t = 300)]
    pub delete_timeout_secs: u64,
}

impl From<&StorageArgs> for AsyncStorageConfig {
    fn from(args: &StorageArgs) -> Self {
        Self {
            pvc_strategy: args.pvc_strategy.clone(),
            pvc_name: args.pvc_name.clone(),
            pvc_quantity: args.pvc_quantity.clone(),
            pvc_access_mode: args.pvc_access_mode.clone(),
            pvc_storage_class: args.pvc_storage_class.clone(),
            image: args.async_storage_image.clone(),
            image_pull_policy: args.image_pull_policy.clone(),
            delete_timeout: Duration::from_secs(args.delete_timeout_secs),
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Tolerations given as one JSON array
#[derive(Clone, Debug, Default)]
pub struct TolerationList(pub Vec<Toleration>);

fn parse_tolerations(s: &str) -> Result<TolerationList, String> {
    serde_json::from_str(s)
        .map(TolerationList)
        .map_err(|e| format!("tolerations must be a JSON array: {}", e))
}

/// `kubews start`
#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Recipe file (multi-document YAML)
    #[arg(long, env = "KUBEWS_RECIPE")]
    pub recipe: PathBuf,

    /// Workspace id
    #[arg(long, env = "KUBEWS_WORKSPACE_ID")]
    pub workspace_id: String,

    /// Id of the workspace owner
    #[arg(long, env = "KUBEWS_OWNER")]
    pub owner: String,

    /// Namespace to create the workspace in
    #[arg(long, env = "KUBEWS_NAMESPACE")]
    pub namespace: String,

    /// Environment name
    #[arg(long, env = "KUBEWS_ENV_NAME", default_value = "default")]
    pub env_name: String,

    /// Print the objects as YAML instead of creating them
    #[arg(long)]
    pub dry_run: bool,

    /// Lowest port installers may be moved to
    #[arg(long, env = "KUBEWS_MIN_PORT", default_value_t = 10000)]
    pub min_port: u16,

    /// Upper bound (exclusive) for moved installer ports
    #[arg(long, env = "KUBEWS_MAX_PORT", default_value_t = 20000)]
    pub max_port: u16,

    /// Service account of workspace pods
    #[arg(long, env = "KUBEWS_SERVICE_ACCOUNT")]
    pub service_account: Option<String>,

    /// Node selector entry, repeatable
    #[arg(long = "node-selector", env = "KUBEWS_NODE_SELECTOR", value_delimiter = ',', value_parser = parse_key_value)]
    pub node_selector: Vec<(String, String)>,

    /// Tolerations as a JSON array
    #[arg(long, env = "KUBEWS_TOLERATIONS", value_parser = parse_tolerations)]
    pub tolerations: Option<TolerationList>,

    /// `securityContext.runAsUser` of workspace pods
    #[arg(long, env = "KUBEWS_RUN_AS_USER")]
    pub run_as_user: Option<i64>,

    /// `securityContext.fsGroup` of workspace pods
    #[arg(long, env = "KUBEWS_FS_GROUP")]
    pub fs_group: Option<i64>,

    /// Termination grace period of workspace pods
    #[arg(long, env = "KUBEWS_TERMINATION_GRACE_PERIOD_SECS")]
    pub termination_grace_period_secs: Option<i64>,

    /// Serve workspace ingresses over TLS
    #[arg(long, env = "KUBEWS_TLS_ENABLED")]
    pub tls_enabled: bool,

    /// Certificate secret for workspace ingresses
    #[arg(long, env = "KUBEWS_TLS_SECRET")]
    pub tls_secret: Option<String>,

    #[command(flatten)]
    pub storage: StorageArgs,
}

impl StartArgs {
    /// Identity of the runtime being started
    pub fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity::new(
            &self.workspace_id,
            &self.env_name,
            &self.owner,
            &self.namespace,
        )
    }

    /// Installer port range
    pub fn port_range(&self) -> PortRange {
        PortRange {
            min: self.min_port,
            max: self.max_port,
        }
    }

    /// Pod spec defaults
    pub fn pod_defaults(&self) -> PodDefaults {
        PodDefaults {
            service_account: self.service_account.clone(),
            node_selector: self.node_selector.iter().cloned().collect::<BTreeMap<_, _>>(),
            tolerations: self.tolerations.clone().unwrap_or_default().0,
            run_as_user: self.run_as_user,
            fs_group: self.fs_group,
            termination_grace_period_seconds: self.termination_grace_period_secs,
        }
    }

    /// Ingress TLS settings
    pub fn tls(&self) -> TlsConfig {
        TlsConfig {
            enabled: self.tls_enabled,
            secret_name: self.tls_secret.clone(),
        }
    }
}

/// `kubews reaper`
#[derive(Args, Debug, Clone)]
pub struct ReaperArgs {
    /// Users may pick their own namespaces
    #[arg(long, env = "KUBEWS_USER_DEFINED_NAMESPACES")]
    pub user_defined_namespaces: bool,

    /// Running workspaces allowed per user
    #[arg(long, env = "KUBEWS_RUN_LIMIT_PER_USER", default_value_t = 1)]
    pub run_limit_per_user: u32,

    /// Template workspace namespaces are derived from
    #[arg(long, env = "KUBEWS_NAMESPACE_TEMPLATE", default_value = "<username>-che")]
    pub namespace_template: String,

    /// Idle seconds after which async storage is removed; 0 disables
    #[arg(long, env = "KUBEWS_SHUTDOWN_TIMEOUT_SECS", default_value_t = 7200)]
    pub shutdown_timeout_secs: u64,

    /// Seconds between sweeps
    #[arg(long, env = "KUBEWS_REAPER_PERIOD_SECS", default_value_t = 1800)]
    pub period_secs: u64,

    /// Users fetched per directory page
    #[arg(long, env = "KUBEWS_REAPER_PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    #[command(flatten)]
    pub storage: StorageArgs,
}

impl From<&ReaperArgs> for ReaperConfig {
    fn from(args: &ReaperArgs) -> Self {
        Self {
            pvc_strategy: args.storage.pvc_strategy.clone(),
            user_defined_namespaces: args.user_defined_namespaces,
            run_limit_per_user: args.run_limit_per_user,
            namespace_template: args.namespace_template.clone(),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            period: Duration::from_secs(args.period_secs),
            page_size: args.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(extra: &[&str]) -> StartArgs {
        let mut argv = vec![
            "kubews",
            "start",
            "--recipe",
            "recipe.yaml",
            "--workspace-id",
            "ws1",
            "--owner",
            "u1",
            "--namespace",
            "alice-che",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Start(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn start_defaults() {
        let args = start(&[]);
        assert_eq!(args.identity(), RuntimeIdentity::new("ws1", "default", "u1", "alice-che"));
        assert_eq!(args.port_range(), PortRange { min: 10000, max: 20000 });
        assert!(!args.dry_run);
        let storage = AsyncStorageConfig::from(&args.storage);
        assert_eq!(storage, AsyncStorageConfig::default());
    }

    #[test]
    fn pod_defaults_from_flags() {
        let args = start(&[
            "--node-selector",
            "pool=dev,zone=a",
            "--tolerations",
            r#"[{"key":"dedicated","operator":"Exists","effect":"NoSchedule"}]"#,
            "--run-as-user",
            "1724",
        ]);
        let defaults = args.pod_defaults();
        assert_eq!(defaults.node_selector["pool"], "dev");
        assert_eq!(defaults.node_selector["zone"], "a");
        assert_eq!(defaults.tolerations[0].key.as_deref(), Some("dedicated"));
        assert_eq!(defaults.run_as_user, Some(1724));
        assert_eq!(defaults.fs_group, None);
    }

    #[test]
    fn malformed_flags_are_rejected() {
        let base = [
            "kubews", "start", "--recipe", "r", "--workspace-id", "w", "--owner", "o",
            "--namespace", "n",
        ];
        let mut bad_selector = base.to_vec();
        bad_selector.extend(["--node-selector", "novalue"]);
        assert!(Cli::try_parse_from(bad_selector).is_err());

        let mut bad_tolerations = base.to_vec();
        bad_tolerations.extend(["--tolerations", "{not json"]);
        assert!(Cli::try_parse_from(bad_tolerations).is_err());
    }

    #[test]
    fn reaper_config_from_flags() {
        let cli = Cli::try_parse_from([
            "kubews",
            "reaper",
            "--shutdown-timeout-secs",
            "60",
            "--namespace-template",
            "ws-<userid>",
        ])
        .unwrap();
        let Commands::Reaper(args) = cli.command else {
            panic!("expected reaper");
        };
        let config = ReaperConfig::from(&args);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.is_enabled());
    }
}
