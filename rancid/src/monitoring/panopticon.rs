use super::labels_for_label_selector;
use crate::{
    apis::monitoring::{
        Endpoint, NamespaceSelector, Prometheus, RelabelConfig, SecretKeySelector,
        SecretOrConfigMap, ServiceMonitor, TlsConfig,
    },
    cluster::{controller_ref, create_or_patch, Cluster, Error},
    manager, project,
};
use k8s_openapi::{api::core::v1::Service, apimachinery::pkg::apis::meta::v1::LabelSelector};

const SA_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SCRAPE_INTERVAL: &str = "10s";

/// Ensures a Prometheus instance scrapes a metrics exporter's Service.
///
/// The exporter serves its API over TLS, with a CA in the
/// `<service>-apiserver-cert` Secret, and its own telemetry over plain HTTP.
/// On Rancher-managed clusters, scraped series are limited to the
/// Prometheus's project.
pub async fn create_panopticon_service_monitor<C: Cluster>(
    cluster: &C,
    prom: &Prometheus,
    service: &Service,
) -> Result<ServiceMonitor, Error> {
    let prom_ns = prom.metadata.namespace.clone().unwrap_or_default();
    let svc_ns = service.metadata.namespace.clone().unwrap_or_default();
    let svc_name = service.metadata.name.clone().ok_or_else(|| Error::MissingName {
        kind: "Service".to_string(),
    })?;

    let (labels, exact) = labels_for_label_selector(prom.spec.service_monitor_selector.as_ref());
    if !exact {
        tracing::warn!(
            ns = %prom_ns,
            name = ?prom.metadata.name,
            "Prometheus uses match expressions in its ServiceMonitor selector"
        );
    }

    let namespaces = if manager::is_rancher_managed(cluster).await {
        project::list_sibling_namespaces(cluster, &prom_ns).await?
    } else {
        Vec::new()
    };

    let mut relabelings = Vec::with_capacity(2);
    if !namespaces.is_empty() {
        relabelings.push(RelabelConfig::keep_namespaces(&namespaces));
    }
    relabelings.push(RelabelConfig::label_drop("pod|service|endpoint|namespace"));

    let endpoints = vec![
        Endpoint {
            port: Some("api".to_string()),
            scheme: Some("https".to_string()),
            interval: Some(SCRAPE_INTERVAL.to_string()),
            bearer_token_file: Some(SA_TOKEN_FILE.to_string()),
            tls_config: Some(TlsConfig {
                ca: Some(SecretOrConfigMap {
                    secret: Some(SecretKeySelector {
                        name: format!("{svc_name}-apiserver-cert"),
                        key: "tls.crt".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
                server_name: Some(format!("{svc_name}.{svc_ns}.svc")),
                ..Default::default()
            }),
            relabelings,
            ..Default::default()
        },
        Endpoint {
            port: Some("telemetry".to_string()),
            scheme: Some("http".to_string()),
            interval: Some(SCRAPE_INTERVAL.to_string()),
            bearer_token_file: Some(SA_TOKEN_FILE.to_string()),
            ..Default::default()
        },
    ];

    let mut seed = ServiceMonitor::new(&svc_name, Default::default());
    seed.metadata.namespace = Some(prom_ns);
    let owner = controller_ref(prom);
    let (sm, _) = create_or_patch(cluster, seed, |obj| {
        obj.metadata.labels.get_or_insert_with(Default::default).extend(labels);
        obj.metadata.owner_references = owner.map(|r| vec![r]);
        obj.spec.namespace_selector = Some(NamespaceSelector {
            any: false,
            match_names: vec![svc_ns],
        });
        obj.spec.selector = LabelSelector {
            match_labels: service.metadata.labels.clone(),
            ..Default::default()
        };
        obj.spec.endpoints = endpoints;
    })
    .await?;
    Ok(sm)
}
