//! Resource usage of a project, measured against its `ProjectQuota`

use crate::{
    apis::management::{ProjectQuota, ProjectQuotaStatus, ResourceList, ResourceQuotaStatus},
    cluster::{self, or_empty, ApiType, ApiTypes, Cluster},
    metrics, project,
    quantity::{add_resource_list, ParseError},
};
use kube::core::GroupVersionKind;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] cluster::Error),

    #[error("project quota {0:?} not found")]
    NotFound(String),

    #[error("no api type {kind:?} served in group {group:?}")]
    UnknownType { group: String, kind: String },

    #[error("cannot apply a quota to cluster-scoped kind {kind:?} in group {group:?}")]
    ClusterScoped { group: String, kind: String },

    #[error("no resource calculator for {kind:?} in group {group:?}")]
    NoCalculator { group: String, kind: String },

    #[error("failed to compute resource usage: {0}")]
    Metrics(#[from] metrics::Error),

    #[error(transparent)]
    Quantity(#[from] ParseError),

    #[error("failed to encode object: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fetches the named quota and fills in its status.
pub async fn get_project_quota<C: Cluster>(cluster: &C, name: &str) -> Result<ProjectQuota, Error> {
    let mut quota = cluster
        .get::<ProjectQuota>(None, name)
        .await?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
    quota.status = Some(calculate_status(cluster, &quota).await?);
    Ok(quota)
}

/// Computes how much of each quota the project's namespaces use.
///
/// The quota is named after its project. A quota with an empty kind sums
/// every namespaced kind served in its group.
pub async fn calculate_status<C: Cluster>(
    cluster: &C,
    quota: &ProjectQuota,
) -> Result<ProjectQuotaStatus, Error> {
    let project = quota.metadata.name.as_deref().unwrap_or_default();
    let namespaces = project::list_project_namespaces(cluster, project).await?;
    let api_types = cluster.api_types().await?;

    let mut status = ProjectQuotaStatus {
        quotas: quota
            .spec
            .quotas
            .iter()
            .map(|q| ResourceQuotaStatus {
                quota: q.clone(),
                used: ResourceList::new(),
            })
            .collect(),
    };

    for ns in &namespaces {
        // A kind may be covered by several quotas; list it once per namespace.
        let mut ns_used = BTreeMap::<(String, String), ResourceList>::new();

        for entry in status.quotas.iter_mut() {
            let types = types_for(&api_types, &entry.quota.group, &entry.quota.kind)?;
            for ty in types {
                let key = (ty.group.clone(), ty.kind.clone());
                if !ns_used.contains_key(&key) {
                    let used = used_quota(cluster, ns, ty).await?;
                    ns_used.insert(key.clone(), used);
                }
                entry.used = add_resource_list(&entry.used, &ns_used[&key])?;
            }
        }
    }

    Ok(status)
}

fn types_for<'a>(
    api_types: &'a ApiTypes,
    group: &'a str,
    kind: &str,
) -> Result<Vec<&'a ApiType>, Error> {
    if kind.is_empty() {
        return Ok(api_types
            .in_group(group)
            .filter(|ty| {
                if !ty.namespaced {
                    tracing::debug!(%group, kind = %ty.kind, "Skipping cluster-scoped kind");
                }
                ty.namespaced
            })
            .collect());
    }

    let ty = api_types.get(group, kind).ok_or_else(|| Error::UnknownType {
        group: group.to_string(),
        kind: kind.to_string(),
    })?;
    if !ty.namespaced {
        return Err(Error::ClusterScoped {
            group: group.to_string(),
            kind: kind.to_string(),
        });
    }
    Ok(vec![ty])
}

/// Sums the usage of every object of a kind in a namespace.
///
/// Kinds without a resource calculator count as unused when they have no
/// objects in the namespace, and fail otherwise.
pub async fn used_quota<C: Cluster>(
    cluster: &C,
    ns: &str,
    ty: &ApiType,
) -> Result<ResourceList, Error> {
    if !ty.namespaced {
        return Err(Error::ClusterScoped {
            group: ty.group.clone(),
            kind: ty.kind.clone(),
        });
    }

    let registered = ty
        .versions
        .iter()
        .map(|v| GroupVersionKind::gvk(&ty.group, v, &ty.kind))
        .find(metrics::is_registered);
    let Some(gvk) = registered else {
        let Some(version) = ty.preferred_version() else {
            return Ok(ResourceList::new());
        };
        let gvk = GroupVersionKind::gvk(&ty.group, version, &ty.kind);
        let objects = or_empty(cluster.list_dynamic(&gvk, &ty.resource, Some(ns)).await)?;
        if objects.is_empty() {
            return Ok(ResourceList::new());
        }
        return Err(Error::NoCalculator {
            group: ty.group.clone(),
            kind: ty.kind.clone(),
        });
    };

    let mut used = ResourceList::new();
    for obj in or_empty(cluster.list_dynamic(&gvk, &ty.resource, Some(ns)).await)? {
        let usage = metrics::quota_usage(&gvk, &serde_json::to_value(&obj)?)?;
        used = add_resource_list(&used, &usage)?;
    }
    Ok(used)
}
