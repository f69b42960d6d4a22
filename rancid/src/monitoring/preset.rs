use crate::{
    apis::{
        charts::{ChartPreset, ClusterChartPreset, DEFAULT_PRESET_LABEL},
        monitoring::Prometheus,
    },
    cluster::{create_or_patch, Cluster, Error, Verb},
    manager::ClusterManager,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Serialize;
use std::collections::BTreeMap;

/// The name of the preset carrying monitoring defaults.
pub const PRESET_NAME: &str = "monitoring-presets";

const AGENT_PROMETHEUS_OPERATOR: &str = "prometheus.io/operator";
const SEVERITY_CRITICAL: &str = "critical";

/// Chart values that point a chart's monitoring at a Prometheus instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MonitoringPresets {
    pub spec: PresetsSpec,
    pub form: PresetsForm,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PresetsSpec {
    pub monitoring: MonitoringSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    pub agent: String,
    pub service_monitor: LabelsPreset,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LabelsPreset {
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PresetsForm {
    pub alert: AlertPreset,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AlertPreset {
    pub enabled: String,
    pub labels: BTreeMap<String, String>,
}

/// Derives labels that a selector would match.
///
/// Only the first match expression is considered when a selector has any,
/// in which case the result is approximate and the returned flag is false.
pub fn labels_for_label_selector(
    sel: Option<&LabelSelector>,
) -> (BTreeMap<String, String>, bool) {
    let Some(sel) = sel else {
        return (BTreeMap::new(), true);
    };
    let Some(expr) = sel.match_expressions.as_ref().and_then(|e| e.first()) else {
        return (sel.match_labels.clone().unwrap_or_default(), true);
    };

    let first = expr
        .values
        .as_ref()
        .and_then(|v| v.first())
        .cloned()
        .unwrap_or_default();
    let labels = match expr.operator.as_str() {
        "In" => BTreeMap::from([(expr.key.clone(), first)]),
        "NotIn" => BTreeMap::from([(expr.key.clone(), format!("not-{first}"))]),
        "Exists" => BTreeMap::from([(expr.key.clone(), String::new())]),
        _ => BTreeMap::new(),
    };
    (labels, false)
}

pub fn generate_preset_for_prometheus(prom: &Prometheus) -> MonitoringPresets {
    let ns = prom.metadata.namespace.as_deref().unwrap_or_default();
    let name = prom.metadata.name.as_deref().unwrap_or_default();

    let (sm_labels, exact) =
        labels_for_label_selector(prom.spec.service_monitor_selector.as_ref());
    if !exact {
        tracing::warn!(
            %ns,
            %name,
            "Prometheus uses match expressions in its ServiceMonitor selector"
        );
    }
    let (rule_labels, exact) = labels_for_label_selector(prom.spec.rule_selector.as_ref());
    if !exact {
        tracing::warn!(%ns, %name, "Prometheus uses match expressions in its rule selector");
    }

    MonitoringPresets {
        spec: PresetsSpec {
            monitoring: MonitoringSpec {
                agent: AGENT_PROMETHEUS_OPERATOR.to_string(),
                service_monitor: LabelsPreset { labels: sm_labels },
            },
        },
        form: PresetsForm {
            alert: AlertPreset {
                enabled: SEVERITY_CRITICAL.to_string(),
                labels: rule_labels,
            },
        },
    }
}

/// Publishes a Prometheus instance's presets where charts will find them.
///
/// A project Prometheus on a Rancher-managed cluster gets a `ChartPreset` in
/// its namespace; every other instance gets the cluster-wide preset.
pub async fn create_preset<C: Cluster>(
    cluster: &C,
    manager: ClusterManager,
    prom: &Prometheus,
    is_default: bool,
) -> Result<Verb, Error> {
    let values = serde_json::to_value(generate_preset_for_prometheus(prom))?;
    let labels = BTreeMap::from([(DEFAULT_PRESET_LABEL.to_string(), "true".to_string())]);

    if manager.is_rancher() && !is_default {
        let mut seed = ChartPreset::new(PRESET_NAME, Default::default());
        seed.metadata.namespace = prom.metadata.namespace.clone();
        let (_, verb) = create_or_patch(cluster, seed, |obj| {
            obj.metadata.labels = Some(labels);
            obj.spec.values = Some(values);
        })
        .await?;
        return Ok(verb);
    }

    let seed = ClusterChartPreset::new(PRESET_NAME, Default::default());
    let (_, verb) = create_or_patch(cluster, seed, |obj| {
        obj.metadata.labels = Some(labels);
        obj.spec.values = Some(values);
    })
    .await?;
    Ok(verb)
}
