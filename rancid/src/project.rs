//! Rancher projects, derived from namespace labels
//!
//! Rancher records a namespace's project in the `field.cattle.io/projectId`
//! label. A [`Project`] is recomputed from a namespace listing every time it
//! is requested; nothing here is persisted.

use crate::{
    apis::{
        charts::{ChartPreset, ClusterChartPreset},
        monitoring::Prometheus,
    },
    cluster::{or_empty, read_string, Cluster, Error},
    manager, topology,
};
use k8s_openapi::{
    api::core::v1::Namespace,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::core::{GroupVersionKind, Selector};
use serde::Serialize;
use std::collections::BTreeMap;

/// Labels a namespace with the ID of the project it belongs to.
pub const PROJECT_ID_LABEL: &str = "field.cattle.io/projectId";

/// Namespaces Rancher provisions on a project's behalf start with this.
pub const HELPER_NAMESPACE_PREFIX: &str = "cattle-project-p-";

/// Holds the system project's monitoring stack.
pub const MONITORING_NAMESPACE: &str = "cattle-monitoring-system";

const DEFAULT_NAMESPACE: &str = "default";
const SYSTEM_NAMESPACE: &str = "kube-system";

const SYSTEM_PROMETHEUS_PROXY: &str = "http:rancher-monitoring-prometheus:9090";
const SYSTEM_ALERTMANAGER_PROXY: &str = "http:rancher-monitoring-alertmanager:9093";
const SYSTEM_GRAFANA_PROXY: &str = "http:rancher-monitoring-grafana:80";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ProjectType {
    /// Holds the `default` namespace.
    Default,
    /// Holds the `kube-system` namespace.
    System,
    #[default]
    User,
}

/// A group of namespaces sharing a project ID.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// The project ID.
    pub name: String,

    #[serde(rename = "type")]
    pub project_type: ProjectType,

    /// Member namespaces, sorted.
    pub namespaces: Vec<String>,

    pub namespace_selector: LabelSelector,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<PresetRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<ProjectMonitoring>,
}

/// A chart preset that applies to a project.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

/// The monitoring stack serving a project.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMonitoring {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_ref: Option<ObjectRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alertmanager_ref: Option<ObjectRef>,

    #[serde(rename = "prometheusURL", skip_serializing_if = "Option::is_none")]
    pub prometheus_url: Option<String>,

    #[serde(rename = "alertmanagerURL", skip_serializing_if = "Option::is_none")]
    pub alertmanager_url: Option<String>,

    #[serde(rename = "grafanaURL", skip_serializing_if = "Option::is_none")]
    pub grafana_url: Option<String>,
}

// === impl Project ===

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        let name = id.into();
        Self {
            namespace_selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    PROJECT_ID_LABEL.to_string(),
                    name.clone(),
                )])),
                ..Default::default()
            },
            name,
            ..Default::default()
        }
    }

    /// Adds a member. `default` outranks `kube-system`, regardless of the
    /// order members are added in.
    fn add_namespace(&mut self, ns: &str) {
        self.namespaces.push(ns.to_string());
        let has = |name: &str| self.namespaces.iter().any(|ns| ns == name);
        self.project_type = if has(DEFAULT_NAMESPACE) {
            ProjectType::Default
        } else if has(SYSTEM_NAMESPACE) {
            ProjectType::System
        } else {
            ProjectType::User
        };
    }

    /// Returns true if every member is a namespace Rancher provisioned.
    pub fn is_helper_only(&self) -> bool {
        self.namespaces
            .iter()
            .all(|ns| ns.starts_with(HELPER_NAMESPACE_PREFIX))
    }

    /// The namespace Rancher registers the project's `ProjectHelmChart`s in.
    pub fn registration_namespace(&self) -> String {
        format!("cattle-project-{}", self.name)
    }
}

/// Groups every labeled namespace into projects, ordered by project ID.
///
/// On Rancher-managed clusters, each project also carries the chart presets
/// that apply to it and the monitoring stack serving it.
pub async fn list_rancher_projects<C: Cluster>(cluster: &C) -> Result<Vec<Project>, Error> {
    let namespaces = or_empty(cluster.list::<Namespace>(None, None).await)?;

    let mut by_id = BTreeMap::<String, Project>::new();
    for ns in &namespaces {
        let Some(name) = ns.metadata.name.as_deref() else {
            continue;
        };
        let Some(id) = project_id_of(ns) else {
            continue;
        };
        by_id
            .entry(id.to_string())
            .or_insert_with(|| Project::new(id))
            .add_namespace(name);
    }

    let mut projects = by_id
        .into_values()
        .filter(|p| !p.is_helper_only())
        .map(|mut p| {
            p.namespaces.sort();
            p
        })
        .collect::<Vec<_>>();

    if manager::is_rancher_managed(cluster).await {
        attach_presets(cluster, &mut projects).await?;
        attach_monitoring(cluster, &mut projects).await?;
    }
    Ok(projects)
}

/// Computes a single project from the namespaces labeled with its ID.
///
/// Returns `None` if no namespace carries the ID.
pub async fn get_rancher_project<C: Cluster>(
    cluster: &C,
    name: &str,
) -> Result<Option<Project>, Error> {
    let mut project = Project::new(name);
    for ns in list_project_namespaces(cluster, name).await? {
        project.add_namespace(&ns);
    }
    if project.namespaces.is_empty() {
        return Ok(None);
    }

    if manager::is_rancher_managed(cluster).await {
        let mut projects = vec![project];
        attach_presets(cluster, &mut projects).await?;
        attach_monitoring(cluster, &mut projects).await?;
        return Ok(projects.pop());
    }
    Ok(Some(project))
}

/// Returns the project ID of a namespace, or `None` if the namespace does
/// not exist or is not in a project.
pub async fn project_id<C: Cluster>(cluster: &C, ns: &str) -> Result<Option<String>, Error> {
    let ns = cluster.get::<Namespace>(None, ns).await?;
    Ok(ns.as_ref().and_then(project_id_of).map(ToString::to_string))
}

pub async fn system_project_id<C: Cluster>(cluster: &C) -> Result<Option<String>, Error> {
    project_id(cluster, SYSTEM_NAMESPACE).await
}

pub async fn default_project_id<C: Cluster>(cluster: &C) -> Result<Option<String>, Error> {
    project_id(cluster, DEFAULT_NAMESPACE).await
}

pub async fn is_in_system_project<C: Cluster>(cluster: &C, ns: &str) -> Result<bool, Error> {
    is_in_project_of(cluster, ns, SYSTEM_NAMESPACE).await
}

pub async fn is_in_default_project<C: Cluster>(cluster: &C, ns: &str) -> Result<bool, Error> {
    is_in_project_of(cluster, ns, DEFAULT_NAMESPACE).await
}

/// Returns true if the namespace belongs to neither the default nor the
/// system project.
pub async fn is_in_user_project<C: Cluster>(cluster: &C, ns: &str) -> Result<bool, Error> {
    Ok(!is_in_default_project(cluster, ns).await? && !is_in_system_project(cluster, ns).await?)
}

/// Returns true if `ns` shares a project with the `seed` namespace.
async fn is_in_project_of<C: Cluster>(cluster: &C, ns: &str, seed: &str) -> Result<bool, Error> {
    if ns == seed {
        return Ok(true);
    }
    let Some(id) = project_id(cluster, ns).await? else {
        return Ok(false);
    };
    Ok(project_id(cluster, seed).await?.as_deref() == Some(id.as_str()))
}

/// Lists the names of a project's namespaces, sorted.
pub async fn list_project_namespaces<C: Cluster>(
    cluster: &C,
    project_id: &str,
) -> Result<Vec<String>, Error> {
    let selector = Selector::from_iter([(PROJECT_ID_LABEL.to_string(), project_id.to_string())]);
    let list = or_empty(cluster.list::<Namespace>(None, Some(&selector)).await)?;
    let mut names = list
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Lists the namespaces in the same project as `ns`, including `ns`.
///
/// Returns an empty list if `ns` is not in a project.
pub async fn list_sibling_namespaces<C: Cluster>(
    cluster: &C,
    ns: &str,
) -> Result<Vec<String>, Error> {
    match project_id(cluster, ns).await? {
        Some(id) => list_project_namespaces(cluster, &id).await,
        None => Ok(Vec::new()),
    }
}

fn project_id_of(ns: &Namespace) -> Option<&str> {
    ns.metadata
        .labels
        .as_ref()?
        .get(PROJECT_ID_LABEL)
        .map(String::as_str)
}

/// Cluster presets apply to the system project. Namespaced presets apply to
/// the project owning their namespace.
async fn attach_presets<C: Cluster>(cluster: &C, projects: &mut [Project]) -> Result<(), Error> {
    let cluster_presets = or_empty(cluster.list::<ClusterChartPreset>(None, None).await)?;
    let presets = or_empty(cluster.list::<ChartPreset>(None, None).await)?;

    for project in projects.iter_mut() {
        let mut refs = if project.project_type == ProjectType::System {
            cluster_presets
                .iter()
                .filter_map(|p| p.metadata.name.clone())
                .map(|name| PresetRef {
                    namespace: None,
                    name,
                    kind: "ClusterChartPreset".to_string(),
                })
                .collect::<Vec<_>>()
        } else {
            presets
                .iter()
                .filter(|p| {
                    p.metadata
                        .namespace
                        .as_ref()
                        .is_some_and(|ns| project.namespaces.contains(ns))
                })
                .filter_map(|p| {
                    Some(PresetRef {
                        namespace: p.metadata.namespace.clone(),
                        name: p.metadata.name.clone()?,
                        kind: "ChartPreset".to_string(),
                    })
                })
                .collect()
        };
        // Ordered by namespace, then name.
        refs.sort();
        project.presets = refs;
    }
    Ok(())
}

async fn attach_monitoring<C: Cluster>(cluster: &C, projects: &mut [Project]) -> Result<(), Error> {
    let proms = or_empty(cluster.list::<Prometheus>(None, None).await)?;

    for prom in &proms {
        let (Some(ns), Some(name)) = (
            prom.metadata.namespace.as_deref(),
            prom.metadata.name.as_deref(),
        ) else {
            continue;
        };

        let project = if ns == MONITORING_NAMESPACE {
            projects
                .iter_mut()
                .find(|p| p.project_type == ProjectType::System)
        } else {
            let id = prom
                .spec
                .service_monitor_namespace_selector
                .as_ref()
                .and_then(|sel| sel.match_labels.as_ref())
                .and_then(|labels| labels.get(PROJECT_ID_LABEL));
            projects.iter_mut().find(|p| Some(&p.name) == id)
        };
        let Some(project) = project else {
            tracing::debug!(%ns, %name, "Prometheus does not serve a project");
            continue;
        };

        let mut monitoring = ProjectMonitoring {
            prometheus_ref: Some(ObjectRef {
                namespace: ns.to_string(),
                name: name.to_string(),
            }),
            alertmanager_ref: topology::find_sibling_alertmanager(cluster, ns)
                .await?
                .and_then(|am| {
                    Some(ObjectRef {
                        namespace: am.metadata.namespace?,
                        name: am.metadata.name?,
                    })
                }),
            ..Default::default()
        };

        if project.project_type == ProjectType::System {
            let proxy = |svc: &str| {
                format!(
                    "{}/api/v1/namespaces/{MONITORING_NAMESPACE}/services/{svc}/proxy",
                    cluster.host()
                )
            };
            monitoring.prometheus_url = Some(proxy(SYSTEM_PROMETHEUS_PROXY));
            monitoring.alertmanager_url = Some(proxy(SYSTEM_ALERTMANAGER_PROXY));
            monitoring.grafana_url = Some(proxy(SYSTEM_GRAFANA_PROXY));
        } else {
            let gvk = GroupVersionKind::gvk("helm.cattle.io", "v1alpha1", "ProjectHelmChart");
            let charts = or_empty(
                cluster
                    .list_dynamic(&gvk, "projecthelmcharts", Some(&project.registration_namespace()))
                    .await,
            )?;
            if let Some(chart) = charts
                .iter()
                .find(|c| read_string(c, "status.dashboardValues.prometheusURL").is_some())
            {
                monitoring.prometheus_url =
                    read_string(chart, "status.dashboardValues.prometheusURL");
                monitoring.alertmanager_url =
                    read_string(chart, "status.dashboardValues.alertmanagerURL");
                monitoring.grafana_url = read_string(chart, "status.dashboardValues.grafanaURL");
            }
        }

        project.monitoring = Some(monitoring);
    }
    Ok(())
}
