//! `charts.x-helm.dev/v1alpha1` chart presets

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Marks a preset as applied to charts by default.
pub const DEFAULT_PRESET_LABEL: &str = "charts.x-helm.dev/is-default-preset";

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "charts.x-helm.dev",
    version = "v1alpha1",
    kind = "ClusterChartPreset",
    schema = "disabled"
)]
pub struct ClusterChartPresetSpec {
    /// Helm values merged into every chart the preset applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "charts.x-helm.dev",
    version = "v1alpha1",
    kind = "ChartPreset",
    namespaced,
    schema = "disabled"
)]
pub struct ChartPresetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}
