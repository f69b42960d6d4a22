//! `meta.k8s.appscode.com/v1alpha1` resource queries
//!
//! A `ResourceQuery` is a virtual object: creating one asks the metadata
//! service to walk its resource graph, and the created object carries the
//! answer in `response`. Nothing is persisted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{Resource, TypeMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

pub const GROUP: &str = "meta.k8s.appscode.com";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "ResourceQuery";

/// Graph edge connecting a workload to the `Service`s that expose it.
pub const EDGE_EXPOSED_BY: &str = "exposed_by";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResourceQuery {
    #[serde(flatten)]
    pub types: TypeMeta,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ResourceQueryRequest>,

    /// The encoded answer, present on the server's copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQueryRequest {
    pub source: SourceInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ResourceLocator>,

    pub output_format: OutputFormat,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourceInfo {
    pub resource: ResourceId,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceId {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceLocator {
    #[serde(rename = "ref")]
    pub target: GroupKind,
    pub query: GraphQuery,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQuery {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub by_label: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum QueryType {
    #[default]
    GraphQL,
    REST,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum OutputFormat {
    /// Matching objects, encoded in full.
    #[default]
    Object,
    /// Matching objects' namespaces and names only.
    Ref,
    Table,
}

// === impl ResourceQuery ===

impl ResourceQuery {
    pub fn new(request: ResourceQueryRequest) -> Self {
        Self {
            types: TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: KIND.to_string(),
            },
            metadata: ObjectMeta::default(),
            request: Some(request),
            response: None,
        }
    }
}

impl Resource for ResourceQuery {
    type DynamicType = ();
    type Scope = k8s_openapi::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "resourcequeries".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
