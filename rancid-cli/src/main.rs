#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use rancid::{
    apis::monitoring::ServiceMonitor,
    errors::LogAndSleep,
    federation::{self, Outcome, FEDERATED_LABEL},
    project, quota,
    shutdown::{self, CancelOnShutdown, Completion},
    topology, Cluster, ClusterManager, KubeCluster,
};
use tokio::time;
use tracing::Instrument;

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    #[clap(flatten)]
    log: rancid::LogArgs,

    #[clap(flatten)]
    client: rancid::ClientArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detects the fleet manager responsible for the cluster
    Detect,

    /// Lists Rancher projects, or describes a single project
    Projects {
        #[clap(long)]
        name: Option<String>,
    },

    /// Lists the kinds served by the API server
    ApiTypes,

    /// Finds the Service exposing a Prometheus
    FindService {
        #[clap(long, short = 'n')]
        namespace: String,

        #[clap(long)]
        name: String,
    },

    /// Grants proxy access to a Prometheus and prints its connection config
    SetupPrometheus {
        #[clap(long, short = 'n')]
        namespace: String,

        #[clap(long)]
        name: String,
    },

    /// Federates a ServiceMonitor into project Prometheus namespaces
    Federate {
        #[clap(long, short = 'n', requires = "name", conflicts_with = "watch")]
        namespace: Option<String>,

        #[clap(long, requires = "namespace")]
        name: Option<String>,

        /// Federate every labeled ServiceMonitor as it changes, until shutdown
        #[clap(long)]
        watch: bool,
    },

    /// Computes the resource usage of a project against its quota
    Quota {
        #[clap(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log,
        client,
        command,
    } = Args::parse();

    log.try_init()?;
    let cluster = client
        .try_cluster()
        .await
        .context("failed to initialize Kubernetes client")?;

    match command {
        Command::Detect => print(&ClusterManager::detect(&cluster).await),

        Command::Projects { name: None } => {
            print(&project::list_rancher_projects(&cluster).await?)
        }
        Command::Projects { name: Some(name) } => {
            match project::get_rancher_project(&cluster, &name).await? {
                Some(project) => print(&project),
                None => bail!("project {name:?} has no namespaces"),
            }
        }

        Command::ApiTypes => print(&cluster.api_types().await?),

        Command::FindService { namespace, name } => {
            print(&topology::find_service_for_prometheus(&cluster, &namespace, &name).await?)
        }

        Command::SetupPrometheus { namespace, name } => {
            print(&topology::setup_cluster_for_prometheus(&cluster, &namespace, &name).await?)
        }

        Command::Federate {
            namespace: Some(ns),
            name: Some(name),
            watch: false,
        } => print(&federation::federate_service_monitor(&cluster, &ns, &name).await?),
        Command::Federate { watch: true, .. } => federate_on_changes(cluster).await,
        Command::Federate { .. } => bail!("either --watch or --namespace and --name is required"),

        Command::Quota { name } => print(&quota::get_project_quota(&cluster, &name).await?),
    }
}

fn print<T: serde::Serialize>(value: &T) -> Result<()> {
    print!("{}", serde_yaml::to_string(value)?);
    Ok(())
}

/// Watches labeled ServiceMonitors cluster-wide and federates each update.
///
/// Runs until SIGINT or SIGTERM. A second signal aborts an in-flight
/// reconciliation.
async fn federate_on_changes(cluster: KubeCluster) -> Result<()> {
    let (shutdown, watch) = shutdown::sigint_or_sigterm()?;

    let api = kube::Api::<ServiceMonitor>::all(cluster.client());
    let config = watcher::Config::default().labels(&format!("{FEDERATED_LABEL}=true"));
    let monitors = LogAndSleep::backoff(
        time::Duration::from_secs(1),
        time::Duration::from_secs(60),
        watcher(api, config).default_backoff().applied_objects(),
    );
    let monitors = CancelOnShutdown::new(watch, monitors);

    let task = tokio::spawn(
        async move {
            tokio::pin!(monitors);
            while let Some(sm) = monitors.next().await {
                let namespace = sm.metadata.namespace.clone().unwrap_or_default();
                let name = sm.metadata.name.clone().unwrap_or_default();
                match federation::federate(&cluster, &sm).await {
                    Ok(Outcome::Synced { targets }) => {
                        tracing::info!(%namespace, %name, targets = targets.len(), "Federated")
                    }
                    Ok(Outcome::Conflict { prometheus }) => tracing::info!(
                        %namespace,
                        %name,
                        prometheus = %prometheus.name,
                        "Skipped conflicting ServiceMonitor"
                    ),
                    Ok(Outcome::Skipped) => tracing::debug!(%namespace, %name, "Skipped"),
                    Err(error) => tracing::warn!(%namespace, %name, %error, "Failed to federate"),
                }
            }
            tracing::debug!("completed");
        }
        .instrument(tracing::info_span!("federate")),
    );

    tokio::select! {
        completion = shutdown.signaled() => {
            if completion == Completion::Aborted {
                bail!("aborted");
            }
        }

        res = task => {
            res.context("federation task failed")?;
            tracing::debug!("watch completed");
        }
    }

    Ok(())
}
