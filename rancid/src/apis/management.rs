//! `management.k8s.appscode.com/v1alpha1` project quotas

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource quantities keyed by resource name, e.g. `requests.cpu`.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Limits on the resources consumed by a project's namespaces.
///
/// The object is named after the project it constrains.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[kube(
    group = "management.k8s.appscode.com",
    version = "v1alpha1",
    kind = "ProjectQuota",
    status = "ProjectQuotaStatus",
    schema = "disabled"
)]
pub struct ProjectQuotaSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotas: Vec<ResourceQuotaSpec>,
}

/// A quota on objects of `group` and `kind`. An empty kind covers every kind
/// in the group.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceQuotaSpec {
    #[serde(default)]
    pub group: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hard: ResourceList,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ProjectQuotaStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotas: Vec<ResourceQuotaStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceQuotaStatus {
    #[serde(flatten)]
    pub quota: ResourceQuotaSpec,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub used: ResourceList,
}
