//! Where a Prometheus instance sits in the cluster's monitoring topology
//!
//! Decides whether an instance is the cluster default, finds the `Service`
//! exposing it, and provisions what a dashboard proxy needs to query it
//! through the API server.

use crate::{
    apis::{
        appcatalog::{
            AppBinding, AppBindingSpec, ClientConfig, ServiceReference, TypedObjectReference,
        },
        meta::{
            GraphQuery, GroupKind, OutputFormat, QueryType, ResourceId, ResourceLocator,
            ResourceQuery, ResourceQueryRequest, SourceInfo, EDGE_EXPOSED_BY,
        },
        monitoring::{self, Alertmanager, Prometheus},
    },
    cluster::{self, controller_ref, create_or_patch, or_empty, Cluster, Verb},
    manager::{self, ClusterManager},
    monitoring::create_preset,
    project,
};
use k8s_openapi::{
    api::{
        core::v1::{Secret, Service, ServiceAccount},
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time;

/// Names the service account, role, and binding a dashboard proxy uses.
pub const PROXY_ACCOUNT: &str = "trickster";

/// Names the `AppBinding` describing the default Prometheus.
pub const DEFAULT_PROMETHEUS_BINDING: &str = "default-prometheus";

const DEFAULT_PROMETHEUS_ANNOTATION: &str = "monitoring.appscode.com/is-default-prometheus";
const SA_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
const SA_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const PROMETHEUS_PORT: &str = "http-web";

const TOKEN_POLL_INTERVAL: time::Duration = time::Duration::from_millis(500);
const TOKEN_TIMEOUT: time::Duration = time::Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] cluster::Error),

    #[error("prometheus {namespace}/{name} not found")]
    PrometheusNotFound { namespace: String, name: String },

    #[error("no service with a cluster IP exposes prometheus {namespace}/{name}")]
    ServiceNotFound { namespace: String, name: String },

    #[error("timed out waiting for secret {namespace}/{name} to hold a token")]
    TokenTimeout { namespace: String, name: String },

    #[error("cluster is not managed by Rancher")]
    NotRancherManaged,

    #[error("malformed resource query response: {0}")]
    MalformedResponse(#[source] serde_json::Error),
}

/// Everything a client needs to query a Prometheus instance through the API
/// server's service proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    pub url: String,
    pub service: ServiceSpec,
    pub bearer_token: String,
    pub tls: TlsConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub scheme: String,
    pub name: String,
    pub namespace: String,
    pub port: String,
    pub path: String,
    pub query: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TlsConfig {
    pub ca: String,
}

#[derive(Deserialize)]
struct ServiceList {
    #[serde(default)]
    items: Vec<Service>,
}

/// Returns true if the named Prometheus is the cluster's default instance.
///
/// On Rancher-managed clusters the default instance lives in the system
/// project. Elsewhere, an instance is the default when it is the only one
/// in its namespace.
pub async fn is_default<C: Cluster>(
    cluster: &C,
    manager: ClusterManager,
    ns: &str,
    name: &str,
) -> Result<bool, Error> {
    match manager {
        ClusterManager::Rancher => is_rancher_system_resource(cluster, ns).await,
        ClusterManager::Ace | ClusterManager::OpenClusterManagement => {
            is_singleton(cluster, ns, name).await
        }
    }
}

/// Returns true if the namespace is in Rancher's system project.
pub async fn is_rancher_system_resource<C: Cluster>(cluster: &C, ns: &str) -> Result<bool, Error> {
    if !manager::is_rancher_managed(cluster).await {
        return Err(Error::NotRancherManaged);
    }
    Ok(project::is_in_system_project(cluster, ns).await?)
}

async fn is_singleton<C: Cluster>(cluster: &C, ns: &str, name: &str) -> Result<bool, Error> {
    let proms = or_empty(cluster.list::<Prometheus>(Some(ns), None).await)?;
    match proms.as_slice() {
        [prom] => Ok(prom.metadata.name.as_deref() == Some(name)),
        [] => Ok(false),
        _ => {
            tracing::warn!(
                %ns,
                count = proms.len(),
                "Several Prometheus instances share a namespace; none is the default"
            );
            Ok(false)
        }
    }
}

/// Asks the metadata service for the `Service` exposing a Prometheus.
///
/// Headless services are skipped; the first service with a cluster IP wins.
pub async fn find_service_for_prometheus<C: Cluster>(
    cluster: &C,
    ns: &str,
    name: &str,
) -> Result<Service, Error> {
    let query = ResourceQuery::new(ResourceQueryRequest {
        source: SourceInfo {
            resource: ResourceId {
                group: monitoring::GROUP.to_string(),
                version: monitoring::VERSION.to_string(),
                kind: "Prometheus".to_string(),
            },
            namespace: ns.to_string(),
            name: name.to_string(),
        },
        target: Some(ResourceLocator {
            target: GroupKind {
                group: String::new(),
                kind: "Service".to_string(),
            },
            query: GraphQuery {
                query_type: QueryType::GraphQL,
                by_label: EDGE_EXPOSED_BY.to_string(),
            },
        }),
        output_format: OutputFormat::Object,
    });

    let answered = cluster.create(&query).await?;
    let list = match answered.response {
        Some(response) => {
            serde_json::from_value::<ServiceList>(response).map_err(Error::MalformedResponse)?
        }
        None => ServiceList { items: Vec::new() },
    };

    list.items
        .into_iter()
        .find(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.cluster_ip.as_deref())
                .is_some_and(|ip| ip != "None")
        })
        .ok_or_else(|| Error::ServiceNotFound {
            namespace: ns.to_string(),
            name: name.to_string(),
        })
}

/// Returns the Alertmanager running beside a Prometheus, if any.
pub async fn find_sibling_alertmanager<C: Cluster>(
    cluster: &C,
    ns: &str,
) -> Result<Option<Alertmanager>, cluster::Error> {
    let list = or_empty(cluster.list::<Alertmanager>(Some(ns), None).await)?;
    if list.len() > 1 {
        tracing::warn!(%ns, count = list.len(), "Several Alertmanagers share a namespace");
    }
    Ok(list.into_iter().next())
}

/// Prepares a cluster for a dashboard proxy to query a Prometheus instance.
///
/// Provisions the proxy's service account with access to `services/proxy`,
/// publishes the instance's chart presets, registers the default instance
/// in an `AppBinding`, and waits for the service account's token.
pub async fn setup_cluster_for_prometheus<C: Cluster>(
    cluster: &C,
    ns: &str,
    name: &str,
) -> Result<PrometheusConfig, Error> {
    let manager = ClusterManager::detect(cluster).await;
    let prom = cluster
        .get::<Prometheus>(Some(ns), name)
        .await?
        .ok_or_else(|| Error::PrometheusNotFound {
            namespace: ns.to_string(),
            name: name.to_string(),
        })?;

    let is_default = is_default(cluster, manager, ns, name).await?;
    tracing::debug!(%ns, %name, %manager, is_default, "Resolved Prometheus");
    let svc = find_service_for_prometheus(cluster, ns, name).await?;

    let owner = controller_ref(&prom).map(|r| vec![r]);
    let meta = || ObjectMeta {
        name: Some(PROXY_ACCOUNT.to_string()),
        namespace: Some(ns.to_string()),
        ..Default::default()
    };

    let sa = ServiceAccount {
        metadata: meta(),
        ..Default::default()
    };
    create_or_patch(cluster, sa, |obj| {
        obj.metadata.owner_references = owner.clone();
    })
    .await?;

    let role = Role {
        metadata: meta(),
        ..Default::default()
    };
    create_or_patch(cluster, role, |obj| {
        obj.metadata.owner_references = owner.clone();
        obj.rules = Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["services/proxy".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]);
    })
    .await?;

    let binding = RoleBinding {
        metadata: meta(),
        ..Default::default()
    };
    create_or_patch(cluster, binding, |obj| {
        obj.metadata.owner_references = owner.clone();
        obj.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: PROXY_ACCOUNT.to_string(),
        };
        obj.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: PROXY_ACCOUNT.to_string(),
            namespace: Some(ns.to_string()),
            ..Default::default()
        }]);
    })
    .await?;

    // Service accounts no longer get a token secret of their own.
    let token_name = format!("{PROXY_ACCOUNT}-token");
    let token = Secret {
        metadata: ObjectMeta {
            name: Some(token_name.clone()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    create_or_patch(cluster, token, |obj| {
        obj.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SA_NAME_ANNOTATION.to_string(), PROXY_ACCOUNT.to_string());
        obj.type_ = Some(SA_TOKEN_TYPE.to_string());
    })
    .await?;

    create_preset(cluster, manager, &prom, is_default).await?;

    if is_default {
        let verb = create_prometheus_app_binding(cluster, &prom, &svc).await?;
        tracing::debug!(%ns, %name, %verb, "Registered default Prometheus");
    }

    let (ca, bearer_token) = wait_for_token(cluster, ns, &token_name).await?;

    let mut service = ServiceSpec {
        scheme: "http".to_string(),
        name: svc.metadata.name.clone().unwrap_or_default(),
        namespace: svc.metadata.namespace.clone().unwrap_or_default(),
        ..Default::default()
    };
    if let Some(port) = prometheus_port(&svc) {
        service.port = port.to_string();
    }
    Ok(PrometheusConfig {
        url: format!(
            "{}/api/v1/namespaces/{}/services/{}:{}:{}/proxy/",
            cluster.host(),
            service.namespace,
            service.scheme,
            service.name,
            service.port
        ),
        service,
        bearer_token,
        tls: TlsConfig { ca },
    })
}

/// Registers the default Prometheus so that other components can find it.
pub async fn create_prometheus_app_binding<C: Cluster>(
    cluster: &C,
    prom: &Prometheus,
    svc: &Service,
) -> Result<Verb, cluster::Error> {
    let ns = prom.metadata.namespace.clone().unwrap_or_default();
    let mut seed = AppBinding::new(DEFAULT_PROMETHEUS_BINDING, AppBindingSpec::default());
    seed.metadata.namespace = Some(ns.clone());

    let (_, verb) = create_or_patch(cluster, seed, |obj| {
        obj.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(DEFAULT_PROMETHEUS_ANNOTATION.to_string(), "true".to_string());
        obj.spec.app_type = "Prometheus".to_string();
        obj.spec.app_ref = Some(TypedObjectReference {
            api_group: monitoring::GROUP.to_string(),
            kind: "Prometheus".to_string(),
            namespace: ns,
            name: prom.metadata.name.clone().unwrap_or_default(),
        });
        obj.spec.client_config = ClientConfig {
            service: Some(ServiceReference {
                scheme: "http".to_string(),
                namespace: svc.metadata.namespace.clone().unwrap_or_default(),
                name: svc.metadata.name.clone().unwrap_or_default(),
                port: prometheus_port(svc).unwrap_or_default(),
                ..Default::default()
            }),
            ..Default::default()
        };
    })
    .await?;
    Ok(verb)
}

fn prometheus_port(svc: &Service) -> Option<i32> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some(PROMETHEUS_PORT))
        .map(|p| p.port)
}

/// Polls a token secret until it holds both a CA bundle and a token.
async fn wait_for_token<C: Cluster>(
    cluster: &C,
    ns: &str,
    name: &str,
) -> Result<(String, String), Error> {
    let poll = async {
        loop {
            let secret = cluster.get::<Secret>(Some(ns), name).await?;
            let data = secret.and_then(|s| s.data).unwrap_or_default();
            if let (Some(ca), Some(token)) = (data.get("ca.crt"), data.get("token")) {
                return Ok::<_, Error>((
                    String::from_utf8_lossy(&ca.0).into_owned(),
                    String::from_utf8_lossy(&token.0).into_owned(),
                ));
            }
            tracing::trace!(%ns, %name, "Waiting for token");
            time::sleep(TOKEN_POLL_INTERVAL).await;
        }
    };

    match time::timeout(TOKEN_TIMEOUT, poll).await {
        Ok(res) => res,
        Err(_) => Err(Error::TokenTimeout {
            namespace: ns.to_string(),
            name: name.to_string(),
        }),
    }
}
