//! Constructs the Kubernetes client shared by every component

use crate::cluster::KubeCluster;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::core::Duration as KubeDuration;
use std::path::PathBuf;

pub use kube::Client;

/// Configures how the Kubernetes client is loaded.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ClientArgs {
    /// The name of the kubeconfig context to use
    #[cfg_attr(feature = "clap", clap(long))]
    pub context: Option<String>,

    /// The name of the kubeconfig cluster to use
    #[cfg_attr(feature = "clap", clap(long))]
    pub cluster: Option<String>,

    /// The name of the kubeconfig user to use
    #[cfg_attr(feature = "clap", clap(long))]
    pub user: Option<String>,

    /// An explicit kubeconfig file, instead of the inferred configuration
    #[cfg_attr(feature = "clap", clap(long, env = "KUBECONFIG"))]
    pub kubeconfig: Option<PathBuf>,

    /// Username to impersonate for API requests
    #[cfg_attr(feature = "clap", clap(long = "as"))]
    pub impersonate_user: Option<String>,

    /// Read timeout for API requests, e.g. `30s`
    #[cfg_attr(feature = "clap", clap(long))]
    pub read_timeout: Option<ReadTimeout>,
}

/// A read timeout parsed from a Go-style duration string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadTimeout(pub std::time::Duration);

/// Indicates that a Kubernetes client could not be configured
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The inferred in-cluster or kubeconfig configuration could not be loaded
    #[error(transparent)]
    Infer(#[from] kube::config::InferConfigError),

    /// An explicit kubeconfig could not be read or applied
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    /// The client could not be built from its configuration
    #[error(transparent)]
    Client(#[from] kube::Error),
}

// === impl ClientArgs ===

impl ClientArgs {
    /// Loads the client configuration and builds a [`KubeCluster`]
    pub async fn try_cluster(self) -> Result<KubeCluster, ConfigError> {
        let config = self.try_config().await?;
        let host = config.cluster_url.to_string();
        let client = Client::try_from(config)?;
        Ok(KubeCluster::new(client, host))
    }

    async fn try_config(self) -> Result<kube::Config, ConfigError> {
        let inferred = self.context.is_none() && self.cluster.is_none() && self.user.is_none();
        let options = KubeConfigOptions {
            context: self.context,
            cluster: self.cluster,
            user: self.user,
        };

        let mut config = match self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
            }
            // Prefer the in-cluster configuration when nothing was selected.
            None if inferred => kube::Config::infer().await?,
            None => kube::Config::from_kubeconfig(&options).await?,
        };

        if let Some(user) = self.impersonate_user {
            config.auth_info.impersonate = Some(user);
        }
        if let Some(ReadTimeout(timeout)) = self.read_timeout {
            config.read_timeout = Some(timeout);
        }
        tracing::debug!(url = %config.cluster_url, "Loaded client configuration");
        Ok(config)
    }
}

// === impl ReadTimeout ===

impl std::str::FromStr for ReadTimeout {
    type Err = <KubeDuration as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<KubeDuration>()?.into()))
    }
}

impl std::fmt::Display for ReadTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        KubeDuration::from(self.0).fmt(f)
    }
}
