//! Federates `ServiceMonitor`s into project Prometheus namespaces
//!
//! A `ServiceMonitor` labeled `monitoring.appscode.com/federated=true` is
//! copied into the namespace of every project Prometheus on a
//! Rancher-managed cluster. Each copy keeps only series from its project's
//! namespaces. The Services, Endpoints, and CA Secrets the copy scrapes
//! through are mirrored beside it. Every mirrored object is owned by its
//! Prometheus, so deleting the Prometheus removes them.

use crate::{
    apis::monitoring::{NamespaceSelector, Prometheus, RelabelConfig, ServiceMonitor},
    cluster::{self, controller_ref, create_or_patch, or_empty, Cluster},
    manager::{self, ClusterManager},
    monitoring::labels_for_label_selector,
    project::{ObjectRef, PROJECT_ID_LABEL},
    topology,
};
use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Secret, Service,
        ServiceSpec,
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::core::Selector;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Marks a `ServiceMonitor` for federation when set to `"true"`.
pub const FEDERATED_LABEL: &str = "monitoring.appscode.com/federated";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] cluster::Error),

    #[error(transparent)]
    Topology(#[from] topology::Error),

    #[error("invalid label selector on {kind} {namespace}/{name}: {reason}")]
    Selector {
        kind: &'static str,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("{}", join(.0))]
    Aggregate(Vec<Error>),
}

/// The result of a federation pass over one `ServiceMonitor`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum Outcome {
    /// The monitor is not federated, or the cluster is not Rancher-managed.
    Skipped,

    /// A project Prometheus shares the monitor's namespace. Nothing was
    /// changed.
    Conflict { prometheus: ObjectRef },

    /// Every Prometheus instance was brought in sync.
    Synced { targets: Vec<ObjectRef> },
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fetches a `ServiceMonitor` and federates it.
///
/// A monitor that no longer exists is skipped.
pub async fn federate_service_monitor<C: Cluster>(
    cluster: &C,
    ns: &str,
    name: &str,
) -> Result<Outcome, Error> {
    match cluster.get::<ServiceMonitor>(Some(ns), name).await? {
        Some(sm) => federate(cluster, &sm).await,
        None => {
            tracing::debug!(%ns, %name, "ServiceMonitor not found");
            Ok(Outcome::Skipped)
        }
    }
}

/// Runs one federation pass for a `ServiceMonitor`.
///
/// The default Prometheus is pointed at the source monitor itself; every
/// other Prometheus gets a copy. Failures for one Prometheus do not stop
/// the others, and are reported together. Nothing is rolled back.
pub async fn federate<C: Cluster>(cluster: &C, src: &ServiceMonitor) -> Result<Outcome, Error> {
    let src_ns = src.metadata.namespace.as_deref().unwrap_or_default();
    let src_name = src.metadata.name.as_deref().unwrap_or_default();

    let federated = src
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(FEDERATED_LABEL))
        .is_some_and(|v| v == "true");
    if !federated || !manager::is_rancher_managed(cluster).await {
        return Ok(Outcome::Skipped);
    }

    let mut targets = Vec::new();
    for prom in or_empty(cluster.list::<Prometheus>(None, None).await)? {
        let (Some(ns), Some(name)) = (
            prom.metadata.namespace.clone(),
            prom.metadata.name.clone(),
        ) else {
            continue;
        };
        let is_default =
            topology::is_default(cluster, ClusterManager::Rancher, &ns, &name).await?;
        if !is_default && ns == src_ns {
            tracing::warn!(
                namespace = %src_ns,
                name = %src_name,
                prometheus = %name,
                "Federated ServiceMonitor shares a namespace with a project Prometheus"
            );
            return Ok(Outcome::Conflict {
                prometheus: ObjectRef {
                    namespace: ns,
                    name,
                },
            });
        }
        targets.push((prom, is_default));
    }

    let prom_namespaces = targets
        .iter()
        .filter_map(|(prom, _)| prom.metadata.namespace.clone())
        .collect::<BTreeSet<_>>();

    let mut synced = Vec::with_capacity(targets.len());
    let mut errors = Vec::new();
    for (prom, is_default) in &targets {
        let res = if *is_default {
            sync_default(cluster, prom, src).await
        } else {
            sync_project(cluster, prom, src, &prom_namespaces).await
        };
        let target = ObjectRef {
            namespace: prom.metadata.namespace.clone().unwrap_or_default(),
            name: prom.metadata.name.clone().unwrap_or_default(),
        };
        match res {
            Ok(()) => synced.push(target),
            Err(error) => {
                tracing::warn!(
                    %error,
                    prometheus.namespace = %target.namespace,
                    prometheus.name = %target.name,
                    "Failed to federate ServiceMonitor"
                );
                errors.push(error);
            }
        }
    }

    if !errors.is_empty() {
        return Err(Error::Aggregate(errors));
    }
    Ok(Outcome::Synced { targets: synced })
}

/// Labels the source monitor so that the default Prometheus selects it.
async fn sync_default<C: Cluster>(
    cluster: &C,
    prom: &Prometheus,
    src: &ServiceMonitor,
) -> Result<(), Error> {
    let (labels, _) = labels_for_label_selector(prom.spec.service_monitor_selector.as_ref());
    let ns = src.metadata.namespace.as_deref();
    let name = src.metadata.name.as_deref().unwrap_or_default();
    let Some(mut current) = cluster.get::<ServiceMonitor>(ns, name).await? else {
        tracing::debug!(namespace = ?ns, %name, "ServiceMonitor deleted before labeling");
        return Ok(());
    };

    let existing = current.metadata.labels.get_or_insert_with(Default::default);
    if labels.iter().all(|(k, v)| existing.get(k) == Some(v)) {
        return Ok(());
    }
    existing.extend(labels);
    cluster.replace(&current).await?;
    tracing::info!(namespace = ?ns, %name, "Labeled ServiceMonitor for the default Prometheus");
    Ok(())
}

/// Copies the source monitor, and what it scrapes through, into a project
/// Prometheus's namespace.
async fn sync_project<C: Cluster>(
    cluster: &C,
    prom: &Prometheus,
    src: &ServiceMonitor,
    prom_namespaces: &BTreeSet<String>,
) -> Result<(), Error> {
    let prom_ns = prom.metadata.namespace.clone().unwrap_or_default();
    let owner = controller_ref(prom);

    let namespaces = project_namespaces(cluster, prom).await?;
    let keep = RelabelConfig::keep_namespaces(&namespaces);
    let (labels, _) = labels_for_label_selector(prom.spec.service_monitor_selector.as_ref());

    let mut copy = ServiceMonitor::new(
        src.metadata.name.as_deref().unwrap_or_default(),
        Default::default(),
    );
    copy.metadata.namespace = Some(prom_ns.clone());
    create_or_patch(cluster, copy, |obj| {
        obj.metadata.owner_references = owner.clone().map(|r| vec![r]);
        obj.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
        obj.spec = src.spec.clone();
        for endpoint in obj.spec.endpoints.iter_mut() {
            endpoint.honor_labels = Some(true);
            if endpoint.relabelings.first() != Some(&keep) {
                endpoint.relabelings.insert(0, keep.clone());
            }
        }
        obj.spec.namespace_selector = Some(NamespaceSelector {
            any: false,
            match_names: vec![prom_ns.clone()],
        });
    })
    .await?;

    for svc in matching_services(cluster, src, prom_namespaces).await? {
        mirror_service(cluster, &prom_ns, owner.as_ref(), &svc).await?;
    }
    copy_ca_secrets(cluster, &prom_ns, owner.as_ref(), src).await?;
    Ok(())
}

/// Lists the namespaces a project Prometheus watches, sorted, without the
/// project's registration namespace.
async fn project_namespaces<C: Cluster>(
    cluster: &C,
    prom: &Prometheus,
) -> Result<Vec<String>, Error> {
    let prom_ns = prom.metadata.namespace.clone().unwrap_or_default();
    let Some(sel) = prom.spec.service_monitor_namespace_selector.clone() else {
        return Ok(vec![prom_ns]);
    };
    let selector = Selector::try_from(sel).map_err(|e| Error::Selector {
        kind: "Prometheus",
        namespace: prom_ns.clone(),
        name: prom.metadata.name.clone().unwrap_or_default(),
        reason: e.to_string(),
    })?;

    let mut names = or_empty(cluster.list::<Namespace>(None, Some(&selector)).await)?
        .into_iter()
        .filter_map(|ns| {
            let name = ns.metadata.name?;
            let id = ns
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(PROJECT_ID_LABEL))
                .cloned()
                .unwrap_or_default();
            (name != format!("cattle-project-{id}")).then_some(name)
        })
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Lists the Services a `ServiceMonitor` selects, at most one per name.
///
/// Headless services have no address to mirror. Services in Prometheus
/// namespaces, or owned by a Prometheus, are mirrors from earlier passes.
/// When names collide across namespaces, the first namespace in sorted
/// order wins.
async fn matching_services<C: Cluster>(
    cluster: &C,
    src: &ServiceMonitor,
    prom_namespaces: &BTreeSet<String>,
) -> Result<Vec<Service>, Error> {
    let src_ns = src.metadata.namespace.clone().unwrap_or_default();
    let selector = Selector::try_from(src.spec.selector.clone()).map_err(|e| Error::Selector {
        kind: "ServiceMonitor",
        namespace: src_ns.clone(),
        name: src.metadata.name.clone().unwrap_or_default(),
        reason: e.to_string(),
    })?;

    let namespaces = match &src.spec.namespace_selector {
        Some(NamespaceSelector { any: true, .. }) => vec![None],
        Some(NamespaceSelector { match_names, .. }) if !match_names.is_empty() => {
            match_names.iter().cloned().map(Some).collect()
        }
        _ => vec![Some(src_ns)],
    };

    let mut candidates = Vec::new();
    for ns in namespaces {
        let list = or_empty(cluster.list::<Service>(ns.as_deref(), Some(&selector)).await)?;
        candidates.extend(list.into_iter().filter(|svc| {
            let in_prom_ns = svc
                .metadata
                .namespace
                .as_ref()
                .is_some_and(|ns| prom_namespaces.contains(ns));
            cluster_ip(svc).is_some() && !in_prom_ns && !is_owned_by_prometheus(svc)
        }));
    }
    candidates.sort_by(|a, b| {
        (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
    });

    let mut services = BTreeMap::<String, Service>::new();
    for svc in candidates {
        let name = svc.metadata.name.clone().unwrap_or_default();
        if let Some(kept) = services.get(&name) {
            tracing::warn!(
                %name,
                kept = ?kept.metadata.namespace,
                skipped = ?svc.metadata.namespace,
                "Services with the same name would share a mirror"
            );
            continue;
        }
        services.insert(name, svc);
    }
    Ok(services.into_values().collect())
}

fn is_owned_by_prometheus(svc: &Service) -> bool {
    svc.metadata.owner_references.iter().flatten().any(|r| {
        r.kind == "Prometheus" && r.api_version.starts_with(crate::apis::monitoring::GROUP)
    })
}

fn cluster_ip(svc: &Service) -> Option<&str> {
    svc.spec
        .as_ref()?
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

/// Mirrors a Service as a selector-less Service whose Endpoints point at
/// the source's cluster IP.
async fn mirror_service<C: Cluster>(
    cluster: &C,
    ns: &str,
    owner: Option<&OwnerReference>,
    src: &Service,
) -> Result<(), Error> {
    let Some(ip) = cluster_ip(src) else {
        return Ok(());
    };
    let name = src.metadata.name.clone().unwrap_or_default();
    let ports = src
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    let mut seed = Service::default();
    seed.metadata.name = Some(name.clone());
    seed.metadata.namespace = Some(ns.to_string());
    create_or_patch(cluster, seed, |obj| {
        obj.metadata.labels = src.metadata.labels.clone();
        obj.metadata.owner_references = owner.cloned().map(|r| vec![r]);
        let spec = obj.spec.get_or_insert_with(ServiceSpec::default);
        spec.type_ = Some("ClusterIP".to_string());
        spec.selector = None;
        spec.ports = Some(
            ports
                .iter()
                .cloned()
                .map(|mut p| {
                    p.node_port = None;
                    p
                })
                .collect(),
        );
    })
    .await?;

    let mut seed = Endpoints::default();
    seed.metadata.name = Some(name);
    seed.metadata.namespace = Some(ns.to_string());
    create_or_patch(cluster, seed, |obj| {
        obj.metadata.labels = src.metadata.labels.clone();
        obj.metadata.owner_references = owner.cloned().map(|r| vec![r]);

        let mut merged = BTreeMap::new();
        for port in obj
            .subsets
            .iter()
            .flatten()
            .flat_map(|s| s.ports.iter().flatten())
        {
            merged.insert(port.name.clone().unwrap_or_default(), port.clone());
        }
        for port in &ports {
            let name = port.name.clone().unwrap_or_default();
            let entry = merged.entry(name.clone()).or_insert_with(|| EndpointPort {
                name: port.name.clone(),
                ..Default::default()
            });
            entry.port = port.port;
            entry.protocol = port.protocol.clone();
        }

        obj.subsets = Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: ip.to_string(),
                ..Default::default()
            }]),
            ports: Some(merged.into_values().collect()),
            ..Default::default()
        }]);
    })
    .await?;
    Ok(())
}

/// Copies the CA Secrets a monitor's endpoints verify TLS with.
async fn copy_ca_secrets<C: Cluster>(
    cluster: &C,
    ns: &str,
    owner: Option<&OwnerReference>,
    src: &ServiceMonitor,
) -> Result<(), Error> {
    let src_ns = src.metadata.namespace.as_deref().unwrap_or_default();
    let mut names = src
        .spec
        .endpoints
        .iter()
        .filter_map(|e| e.tls_config.as_ref()?.ca.as_ref()?.secret.as_ref())
        .map(|s| s.name.clone())
        .collect::<Vec<_>>();
    names.sort();
    names.dedup();

    for name in names {
        let Some(secret) = cluster.get::<Secret>(Some(src_ns), &name).await? else {
            tracing::warn!(namespace = %src_ns, %name, "CA secret not found");
            continue;
        };
        let mut seed = Secret::default();
        seed.metadata.name = Some(name);
        seed.metadata.namespace = Some(ns.to_string());
        create_or_patch(cluster, seed, |obj| {
            obj.metadata.owner_references = owner.cloned().map(|r| vec![r]);
            obj.type_ = secret.type_.clone();
            obj.data = secret.data.clone();
        })
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apis::monitoring::{
            Endpoint, PrometheusSpec, SecretKeySelector, SecretOrConfigMap, ServiceMonitorSpec,
            TlsConfig,
        },
        cluster::fake::FakeCluster,
    };
    use k8s_openapi::{
        api::core::v1::ServicePort,
        apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
        ByteString,
    };
    use maplit::btreemap;

    fn selector_for(labels: &BTreeMap<String, String>) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        }
    }

    fn ns(name: &str, project: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(btreemap! { PROJECT_ID_LABEL.to_string() => project.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn prom(ns: &str, name: &str, release: &str, project: Option<&str>) -> Prometheus {
        let mut prom = Prometheus::new(
            name,
            PrometheusSpec {
                service_monitor_selector: Some(selector_for(
                    &btreemap! { "release".to_string() => release.to_string() },
                )),
                service_monitor_namespace_selector: project.map(|id| {
                    selector_for(&btreemap! { PROJECT_ID_LABEL.to_string() => id.to_string() })
                }),
                ..Default::default()
            },
        );
        prom.metadata.namespace = Some(ns.to_string());
        prom.metadata.uid = Some(format!("{name}-uid"));
        prom
    }

    fn service_monitor(ns: &str) -> ServiceMonitor {
        let mut sm = ServiceMonitor::new(
            "db",
            ServiceMonitorSpec {
                selector: selector_for(&btreemap! { "app".to_string() => "db".to_string() }),
                endpoints: vec![Endpoint {
                    port: Some("metrics".to_string()),
                    tls_config: Some(TlsConfig {
                        ca: Some(SecretOrConfigMap {
                            secret: Some(SecretKeySelector {
                                name: "db-ca".to_string(),
                                key: "ca.crt".to_string(),
                                optional: None,
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        sm.metadata.namespace = Some(ns.to_string());
        sm.metadata.labels = Some(btreemap! { FEDERATED_LABEL.to_string() => "true".to_string() });
        sm
    }

    fn service(ns: &str, name: &str, cluster_ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(btreemap! { "app".to_string() => "db".to_string() }),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                selector: Some(btreemap! { "app".to_string() => "db".to_string() }),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".to_string()),
                    port: 9187,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ca_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("db-ca".to_string()),
                namespace: Some("web".to_string()),
                ..Default::default()
            },
            data: Some(btreemap! { "ca.crt".to_string() => ByteString(b"CA".to_vec()) }),
            ..Default::default()
        }
    }

    const PROJECT_NS: &str = "cattle-project-p-web-monitoring";

    fn cluster() -> FakeCluster {
        FakeCluster::default()
            .serving("management.cattle.io", "Cluster")
            .with(ns("kube-system", "p-system"))
            .with(ns("cattle-monitoring-system", "p-system"))
            .with(ns("web", "p-web"))
            .with(ns("api", "p-web"))
            .with(ns("cattle-project-p-web", "p-web"))
            .with(ns(PROJECT_NS, "p-web"))
            .with(prom(
                "cattle-monitoring-system",
                "rancher-monitoring-prometheus",
                "rancher-monitoring",
                None,
            ))
            .with(prom(PROJECT_NS, "project-prometheus", "project", Some("p-web")))
            .with(service_monitor("web"))
            .with(service("web", "db", "10.0.0.5"))
            .with(service("web", "db-headless", "None"))
            .with(ca_secret())
    }

    fn copy(cluster: &FakeCluster) -> ServiceMonitor {
        cluster
            .object::<ServiceMonitor>(Some(PROJECT_NS), "db")
            .expect("federated copy")
    }

    #[tokio::test]
    async fn copies_into_project_namespaces() {
        let cluster = cluster();
        let outcome = federate_service_monitor(&cluster, "web", "db")
            .await
            .expect("federate");
        let Outcome::Synced { targets } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(targets.len(), 2);

        let copy = copy(&cluster);
        assert_eq!(
            copy.metadata.labels,
            Some(btreemap! { "release".to_string() => "project".to_string() })
        );
        let owner = &copy.metadata.owner_references.clone().expect("owner")[0];
        assert_eq!(owner.uid, "project-prometheus-uid");

        let endpoint = &copy.spec.endpoints[0];
        assert_eq!(endpoint.honor_labels, Some(true));
        assert_eq!(
            endpoint.relabelings,
            vec![RelabelConfig::keep_namespaces(&["api", PROJECT_NS, "web"])]
        );
        assert_eq!(
            copy.spec.namespace_selector.map(|s| s.match_names),
            Some(vec![PROJECT_NS.to_string()])
        );

        let src = cluster
            .object::<ServiceMonitor>(Some("web"), "db")
            .expect("source");
        assert_eq!(
            src.metadata.labels.expect("labels").get("release").map(String::as_str),
            Some("rancher-monitoring")
        );
    }

    #[tokio::test]
    async fn mirrors_services_endpoints_and_secrets() {
        let cluster = cluster();
        federate_service_monitor(&cluster, "web", "db")
            .await
            .expect("federate");

        let svc = cluster
            .object::<Service>(Some(PROJECT_NS), "db")
            .expect("mirrored service");
        let spec = svc.spec.expect("spec");
        assert_eq!(spec.selector, None);
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert!(cluster
            .object::<Service>(Some(PROJECT_NS), "db-headless")
            .is_none());

        let endpoints = cluster
            .object::<Endpoints>(Some(PROJECT_NS), "db")
            .expect("mirrored endpoints");
        let subset = &endpoints.subsets.expect("subsets")[0];
        assert_eq!(subset.addresses.as_ref().expect("addresses")[0].ip, "10.0.0.5");
        let ports = subset.ports.as_ref().expect("ports");
        assert_eq!(
            (ports[0].name.as_deref(), ports[0].port),
            (Some("metrics"), 9187)
        );

        let secret = cluster
            .object::<Secret>(Some(PROJECT_NS), "db-ca")
            .expect("copied secret");
        assert_eq!(secret.data, ca_secret().data);
    }

    #[tokio::test]
    async fn keep_rule_is_prepended_once() {
        let cluster = cluster();
        for _ in 0..2 {
            federate_service_monitor(&cluster, "web", "db")
                .await
                .expect("federate");
        }
        let keep = RelabelConfig::keep_namespaces(&["api", PROJECT_NS, "web"]);
        assert_eq!(copy(&cluster).spec.endpoints[0].relabelings, vec![keep.clone()]);

        // A source that already leads with the rule is not given a second.
        let mut src = service_monitor("web");
        src.spec.endpoints[0].relabelings = vec![keep.clone(), RelabelConfig::label_drop("pod")];
        federate(&cluster, &src).await.expect("federate");
        assert_eq!(
            copy(&cluster).spec.endpoints[0].relabelings,
            vec![keep, RelabelConfig::label_drop("pod")]
        );
    }

    fn any_namespace(mut sm: ServiceMonitor) -> ServiceMonitor {
        sm.spec.namespace_selector = Some(NamespaceSelector {
            any: true,
            match_names: vec![],
        });
        sm
    }

    fn endpoint_ip(cluster: &FakeCluster) -> String {
        let endpoints = cluster
            .object::<Endpoints>(Some(PROJECT_NS), "db")
            .expect("mirrored endpoints");
        endpoints.subsets.expect("subsets")[0]
            .addresses
            .as_ref()
            .expect("addresses")[0]
            .ip
            .clone()
    }

    #[tokio::test]
    async fn mirrors_are_not_mirrored_again() {
        let cluster = cluster();
        let src = any_namespace(service_monitor("web"));
        federate(&cluster, &src).await.expect("federate");
        assert_eq!(endpoint_ip(&cluster), "10.0.0.5");

        // The API server assigns the mirror its own address.
        let mut mirror = cluster
            .object::<Service>(Some(PROJECT_NS), "db")
            .expect("mirrored service");
        mirror.spec.as_mut().expect("spec").cluster_ip = Some("10.0.0.99".to_string());
        cluster.insert(&mirror);

        federate(&cluster, &src).await.expect("federate");
        assert_eq!(endpoint_ip(&cluster), "10.0.0.5");
    }

    #[tokio::test]
    async fn same_named_services_mirror_the_first_namespace() {
        let cluster = cluster().with(service("api", "db", "10.0.0.7"));
        federate(&cluster, &any_namespace(service_monitor("web")))
            .await
            .expect("federate");
        assert_eq!(endpoint_ip(&cluster), "10.0.0.7");
    }

    #[tokio::test]
    async fn deleted_sources_are_not_recreated() {
        let cluster = cluster();
        let mut src = service_monitor("web");
        src.metadata.name = Some("gone".to_string());
        federate(&cluster, &src).await.expect("federate");

        assert!(cluster
            .object::<ServiceMonitor>(Some("web"), "gone")
            .is_none());
        assert!(!cluster
            .mutations()
            .iter()
            .any(|m| m.kind == "ServiceMonitor" && m.namespace.as_deref() == Some("web")));
    }

    #[tokio::test]
    async fn conflicts_with_a_colocated_project_prometheus() {
        let cluster = cluster().with(service_monitor(PROJECT_NS));
        let outcome = federate_service_monitor(&cluster, PROJECT_NS, "db")
            .await
            .expect("federate");
        assert_eq!(
            outcome,
            Outcome::Conflict {
                prometheus: ObjectRef {
                    namespace: PROJECT_NS.to_string(),
                    name: "project-prometheus".to_string(),
                },
            }
        );
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn skips_unlabeled_monitors_and_unmanaged_clusters() {
        let cluster = cluster();
        let mut src = service_monitor("web");
        src.metadata.labels =
            Some(btreemap! { FEDERATED_LABEL.to_string() => "false".to_string() });
        assert_eq!(federate(&cluster, &src).await.expect("federate"), Outcome::Skipped);

        let unmanaged = FakeCluster::default().with(service_monitor("web"));
        assert_eq!(
            federate_service_monitor(&unmanaged, "web", "db")
                .await
                .expect("federate"),
            Outcome::Skipped
        );
        assert_eq!(
            federate_service_monitor(&cluster, "web", "missing")
                .await
                .expect("federate"),
            Outcome::Skipped
        );
        assert!(cluster.mutations().is_empty());
        assert!(unmanaged.mutations().is_empty());
    }

    #[tokio::test]
    async fn collects_failures_across_targets() {
        let cluster = cluster()
            .with(ns("cattle-project-p-api-monitoring", "p-api"))
            .with(prom(
                "cattle-project-p-api-monitoring",
                "api-prometheus",
                "api",
                Some("p-api"),
            ))
            .failing_writes_in(PROJECT_NS);

        let err = federate_service_monitor(&cluster, "web", "db")
            .await
            .expect_err("must fail");
        let Error::Aggregate(errors) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(errors.len(), 1);

        // The healthy target was still federated.
        assert!(cluster
            .object::<ServiceMonitor>(Some("cattle-project-p-api-monitoring"), "db")
            .is_some());
    }
}
