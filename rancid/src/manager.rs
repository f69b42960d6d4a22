//! Detects which fleet manager, if any, manages the cluster

use crate::cluster::Cluster;

/// The fleet manager responsible for a cluster.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum ClusterManager {
    /// Unmanaged, or managed by ACE directly.
    #[default]
    #[serde(rename = "ACE")]
    Ace,

    /// Rancher, detected through its `management.cattle.io` API.
    Rancher,

    /// Open Cluster Management, detected through its cluster and work APIs.
    OpenClusterManagement,
}

const RANCHER_GROUP: &str = "management.cattle.io";
const OCM_CLUSTER_GROUP: &str = "cluster.open-cluster-management.io";
const OCM_WORK_GROUP: &str = "work.open-cluster-management.io";

// === impl ClusterManager ===

impl ClusterManager {
    /// Probes the API server for the kinds each manager installs.
    ///
    /// Probe failures count as "absent". Open Cluster Management takes
    /// precedence over Rancher.
    pub async fn detect<C: Cluster>(cluster: &C) -> Self {
        if is_open_cluster_managed(cluster).await {
            return Self::OpenClusterManagement;
        }
        if is_rancher_managed(cluster).await {
            return Self::Rancher;
        }
        Self::Ace
    }

    #[inline]
    pub fn is_rancher(&self) -> bool {
        matches!(self, Self::Rancher)
    }
}

impl std::fmt::Display for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ace => "ACE".fmt(f),
            Self::Rancher => "Rancher".fmt(f),
            Self::OpenClusterManagement => "OpenClusterManagement".fmt(f),
        }
    }
}

/// Returns true if Rancher's management `Cluster` kind is served.
pub async fn is_rancher_managed<C: Cluster>(cluster: &C) -> bool {
    cluster.has_kind(RANCHER_GROUP, "Cluster").await
}

/// Returns true if either Open Cluster Management kind is served.
pub async fn is_open_cluster_managed<C: Cluster>(cluster: &C) -> bool {
    cluster.has_kind(OCM_CLUSTER_GROUP, "ManagedCluster").await
        || cluster.has_kind(OCM_WORK_GROUP, "AppliedManifestWork").await
}
