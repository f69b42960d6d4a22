//! The API-server capability every component is written against
//!
//! [`Cluster`] is deliberately narrow: a probe for whether a kind is served,
//! the discovery catalog, typed reads and writes of any object, and
//! schemaless listing for kinds this crate does not model. [`KubeCluster`]
//! implements it with a [`kube::Client`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind, Resource, Selector};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

mod discovery;
mod kube_cluster;

#[cfg(test)]
pub(crate) mod fake;

pub use self::discovery::{compare_versions, ApiType, ApiTypes};
pub use self::kube_cluster::KubeCluster;

/// A Kubernetes object type with a statically known group, version, and kind.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Access to a Kubernetes API server.
///
/// `namespace` is `None` for cluster-scoped objects and for cluster-wide
/// listings of namespaced objects.
pub trait Cluster: Send + Sync {
    /// The API server's base URL.
    fn host(&self) -> &str;

    /// Returns true if the API server serves the given group and kind.
    ///
    /// Failures are reported as "not served".
    fn has_kind(&self, group: &str, kind: &str) -> impl Future<Output = bool> + Send;

    /// Builds the catalog of every kind the API server serves.
    fn api_types(&self) -> impl Future<Output = Result<ApiTypes, Error>> + Send;

    /// Lists objects, optionally restricted by a label selector.
    ///
    /// Returns [`Error::NoKind`] when the kind is not served.
    fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> impl Future<Output = Result<Vec<K>, Error>> + Send;

    /// Fetches an object, returning `None` if it does not exist.
    fn get<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> impl Future<Output = Result<Option<K>, Error>> + Send;

    /// Creates an object and returns the server's copy.
    fn create<K: Object>(&self, obj: &K) -> impl Future<Output = Result<K, Error>> + Send;

    /// Replaces an object. The object's `resourceVersion` guards against
    /// concurrent writers.
    fn replace<K: Object>(&self, obj: &K) -> impl Future<Output = Result<K, Error>> + Send;

    /// Lists objects of a kind without a Rust type.
    fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        plural: &str,
        namespace: Option<&str>,
    ) -> impl Future<Output = Result<Vec<DynamicObject>, Error>> + Send;
}

/// Indicates an error interacting with the Kubernetes API
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error was received from the Kubernetes API
    #[error("kubernetes api request failed: {0}")]
    Api(#[from] kube::Error),

    /// The API server does not serve the requested kind
    #[error("no matches for kind {kind:?} in group {group:?}")]
    NoKind {
        /// API group
        group: String,
        /// Kind
        kind: String,
    },

    /// An object could not be converted to or from its wire form
    #[error("failed to convert object: {0}")]
    Convert(#[from] serde_json::Error),

    /// An object was written without a name
    #[error("{kind} object has no name")]
    MissingName {
        /// Kind
        kind: String,
    },
}

/// The outcome of [`create_or_patch`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// The object did not exist and was created
    Created,
    /// The object existed and was updated
    Patched,
    /// The object already matched
    Unchanged,
}

// === impl Error ===

impl Error {
    /// Returns true if the API server reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api(kube::Error::Api(rsp)) if rsp.code == 404)
    }

    /// Returns true if a write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Api(kube::Error::Api(rsp)) if rsp.code == 409)
    }

    /// Returns true if the requested kind is not served.
    pub fn is_no_kind(&self) -> bool {
        matches!(self, Error::NoKind { .. })
    }
}

// === impl Verb ===

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Created => "created".fmt(f),
            Verb::Patched => "patched".fmt(f),
            Verb::Unchanged => "unchanged".fmt(f),
        }
    }
}

/// Ensures that an object matches the result of `mutate`.
///
/// `seed` identifies the object by name and namespace. If it exists, the
/// server's copy is mutated and replaced only when the mutation changed it.
/// Otherwise `seed` is mutated and created.
pub async fn create_or_patch<C, K, F>(cluster: &C, seed: K, mutate: F) -> Result<(K, Verb), Error>
where
    C: Cluster,
    K: Object,
    F: FnOnce(&mut K),
{
    let kind = K::kind(&());
    let name = seed.meta().name.clone().ok_or_else(|| Error::MissingName {
        kind: kind.to_string(),
    })?;
    let namespace = seed.meta().namespace.clone();

    let (obj, verb) = match cluster.get::<K>(namespace.as_deref(), &name).await? {
        None => {
            let mut obj = seed;
            mutate(&mut obj);
            (cluster.create(&obj).await?, Verb::Created)
        }
        Some(current) => {
            let before = serde_json::to_value(&current)?;
            let mut obj = current;
            mutate(&mut obj);
            if serde_json::to_value(&obj)? == before {
                (obj, Verb::Unchanged)
            } else {
                (cluster.replace(&obj).await?, Verb::Patched)
            }
        }
    };

    tracing::info!(
        %verb,
        %kind,
        namespace = namespace.as_deref().unwrap_or_default(),
        %name,
        "Ensured object"
    );
    Ok((obj, verb))
}

/// Builds a controller owner reference pointing at `owner`.
///
/// Returns `None` if the owner has not been persisted (it lacks a name or
/// UID).
pub fn controller_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

/// Reads the string at a dot-separated field path of a schemaless object,
/// e.g. `status.dashboardValues.grafanaURL`.
pub fn read_string(obj: &DynamicObject, path: &str) -> Option<String> {
    path.split('.')
        .try_fold(&obj.data, |value, field| value.get(field))?
        .as_str()
        .map(ToString::to_string)
}

/// Treats an unserved kind as an empty listing.
pub(crate) fn or_empty<T>(res: Result<Vec<T>, Error>) -> Result<Vec<T>, Error> {
    match res {
        Err(error) if error.is_no_kind() => {
            tracing::debug!(%error, "Kind not served; treating as empty");
            Ok(Vec::new())
        }
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use super::{create_or_patch, fake::FakeCluster, Verb};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use maplit::btreemap;

    fn seed() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("apps".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_then_patches_then_settles() {
        let cluster = FakeCluster::default();
        let set_mode = |mode: &'static str| {
            move |cm: &mut ConfigMap| {
                cm.data = Some(btreemap! { "mode".to_string() => mode.to_string() });
            }
        };

        let (cm, verb) = create_or_patch(&cluster, seed(), set_mode("a"))
            .await
            .expect("create");
        assert_eq!(verb, Verb::Created);
        assert!(cm.metadata.uid.is_some());

        let (_, verb) = create_or_patch(&cluster, seed(), set_mode("a"))
            .await
            .expect("noop");
        assert_eq!(verb, Verb::Unchanged);

        let (cm, verb) = create_or_patch(&cluster, seed(), set_mode("b"))
            .await
            .expect("patch");
        assert_eq!(verb, Verb::Patched);
        assert_eq!(cm.data.unwrap()["mode"], "b");
        assert_eq!(cluster.mutations().len(), 2);
    }

    #[test]
    fn reads_nested_strings() {
        let obj: kube::core::DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "helm.cattle.io/v1alpha1",
            "kind": "ProjectHelmChart",
            "metadata": { "name": "monitoring" },
            "status": { "dashboardValues": { "grafanaURL": "https://grafana", "port": 80 } }
        }))
        .expect("must parse");
        assert_eq!(
            super::read_string(&obj, "status.dashboardValues.grafanaURL").as_deref(),
            Some("https://grafana")
        );
        assert_eq!(super::read_string(&obj, "status.dashboardValues.port"), None);
        assert_eq!(super::read_string(&obj, "status.missing.field"), None);
    }

    #[tokio::test]
    async fn requires_a_name() {
        let cluster = FakeCluster::default();
        let err = create_or_patch(&cluster, ConfigMap::default(), |_| {})
            .await
            .expect_err("must fail");
        assert!(matches!(err, super::Error::MissingName { .. }));
    }
}
