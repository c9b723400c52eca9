//! kubews - workspace starts and the async storage reaper

mod cli;
mod directory;
mod pipeline;
mod start;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use kubews_common::kube_utils::create_client;
use kubews_common::telemetry::{init_telemetry, TelemetryConfig};
use kubews_common::KubeNamespaceOps;
use kubews_environment::Submitter;
use kubews_storage::{AsyncStorageConfig, AsyncStoragePodReaper, ReaperConfig};

use cli::{Cli, Commands, LogFormat, ReaperArgs, StartArgs};
use directory::FileDirectory;
use pipeline::{build_pipeline, Collaborators, PipelineSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client's TLS stack needs a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let service_name = match cli.command {
        Commands::Start(_) => "kubews-start",
        Commands::Reaper(_) => "kubews-reaper",
    };
    init_telemetry(TelemetryConfig {
        service_name: service_name.to_string(),
        json: cli.log_format == LogFormat::Json,
    })?;

    let directory = Arc::new(match &cli.directory {
        Some(path) => FileDirectory::load(path).await?,
        None => FileDirectory::empty(),
    });
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let ops = Arc::new(KubeNamespaceOps::new(client));

    let collaborators = Collaborators {
        ops,
        preferences: directory.clone(),
        users: directory.clone(),
        ssh: directory.clone(),
    };

    match &cli.command {
        Commands::Start(args) => run_start(args, &collaborators).await,
        Commands::Reaper(args) => run_reaper(args, &collaborators, directory).await,
    }
}

async fn run_start(args: &StartArgs, collaborators: &Collaborators) -> anyhow::Result<()> {
    let recipe = tokio::fs::read_to_string(&args.recipe)
        .await
        .with_context(|| format!("failed to read recipe {}", args.recipe.display()))?;

    let settings = PipelineSettings {
        ports: args.port_range(),
        pod_defaults: args.pod_defaults(),
        tls: args.tls(),
        storage: AsyncStorageConfig::from(&args.storage),
        dry_run: args.dry_run,
    };
    let pipeline = build_pipeline(&settings, collaborators);
    info!(steps = ?pipeline.names(), "pipeline assembled");

    let submitter = Submitter::new(collaborators.ops.clone());
    let outcome = start::start_workspace(
        &recipe,
        &args.identity(),
        &pipeline,
        (!args.dry_run).then_some(&submitter),
    )
    .await?;

    for warning in &outcome.warnings {
        eprintln!("warning {}: {}", warning.code, warning.message);
    }
    if let Some(manifests) = outcome.manifests {
        print!("{}", manifests);
    }
    if let Some(report) = outcome.submitted {
        for (kind, count) in &report.created {
            println!("{}: {}", kind, count);
        }
    }
    Ok(())
}

async fn run_reaper(
    args: &ReaperArgs,
    collaborators: &Collaborators,
    directory: Arc<FileDirectory>,
) -> anyhow::Result<()> {
    let reaper = Arc::new(AsyncStoragePodReaper::new(
        ReaperConfig::from(args),
        collaborators.ops.clone(),
        collaborators.users.clone(),
        collaborators.preferences.clone(),
        directory,
    ));

    let Some(handle) = reaper.start() else {
        return Ok(());
    };

    tokio::select! {
        result = handle => {
            result.context("reaper task failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            warn!("shutdown signal received, stopping reaper");
        }
    }
    Ok(())
}
