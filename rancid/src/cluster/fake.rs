//! An in-memory [`Cluster`] for tests.

use super::{ApiTypes, Cluster, Error, Object};
use kube::core::{DynamicObject, ErrorResponse, GroupVersionKind, Selector, SelectorExt};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

type Key = (String, String, Option<String>, String);

#[derive(Debug, Default)]
pub(crate) struct FakeCluster {
    host: String,
    served: BTreeSet<(String, String)>,
    unserved: BTreeSet<(String, String)>,
    api_types: ApiTypes,
    objects: Mutex<BTreeMap<Key, Value>>,
    dynamic: BTreeMap<(String, String, Option<String>), Vec<DynamicObject>>,
    query_response: Option<Value>,
    failing_namespaces: BTreeSet<String>,
    mutations: Mutex<Vec<Mutation>>,
    next_uid: Mutex<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Mutation {
    pub verb: &'static str,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl FakeCluster {
    pub(crate) fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Marks a kind as served for [`Cluster::has_kind`].
    pub(crate) fn serving(mut self, group: &str, kind: &str) -> Self {
        self.served.insert((group.to_string(), kind.to_string()));
        self
    }

    /// Causes listings of a kind to fail with [`Error::NoKind`].
    pub(crate) fn not_serving(mut self, group: &str, kind: &str) -> Self {
        self.unserved.insert((group.to_string(), kind.to_string()));
        self
    }

    pub(crate) fn with_api_type(
        mut self,
        group: &str,
        version: &str,
        kind: &str,
        resource: &str,
        namespaced: bool,
    ) -> Self {
        self.api_types
            .insert(group, version, kind, resource, namespaced);
        self
    }

    pub(crate) fn with<K: Object>(self, obj: K) -> Self {
        self.insert(&obj);
        self
    }

    pub(crate) fn with_dynamic(mut self, gvk: &GroupVersionKind, obj: DynamicObject) -> Self {
        let key = (
            gvk.group.clone(),
            gvk.kind.clone(),
            obj.metadata.namespace.clone(),
        );
        self.dynamic.entry(key).or_default().push(obj);
        self
    }

    /// Sets the response the metadata service attaches to created queries.
    pub(crate) fn with_query_response(mut self, response: Value) -> Self {
        self.query_response = Some(response);
        self
    }

    /// Causes writes into a namespace to fail.
    pub(crate) fn failing_writes_in(mut self, namespace: &str) -> Self {
        self.failing_namespaces.insert(namespace.to_string());
        self
    }

    pub(crate) fn insert<K: Object>(&self, obj: &K) {
        let key = Self::key::<K>(
            obj.meta().namespace.as_deref(),
            obj.meta().name.as_deref().unwrap_or_default(),
        );
        let value = serde_json::to_value(obj).expect("object must serialize");
        self.objects.lock().unwrap().insert(key, value);
    }

    pub(crate) fn object<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("object must deserialize"))
    }

    pub(crate) fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    fn key<K: Object>(namespace: Option<&str>, name: &str) -> Key {
        (
            K::group(&()).into_owned(),
            K::kind(&()).into_owned(),
            namespace.map(ToString::to_string),
            name.to_string(),
        )
    }

    fn record<K: Object>(&self, verb: &'static str, obj: &K) -> Result<(), Error> {
        let namespace = obj.meta().namespace.clone();
        if let Some(ns) = namespace.as_deref() {
            if self.failing_namespaces.contains(ns) {
                return Err(api_error(500, "InternalError", "injected failure"));
            }
        }
        self.mutations.lock().unwrap().push(Mutation {
            verb,
            kind: K::kind(&()).into_owned(),
            namespace,
            name: obj.meta().name.clone().unwrap_or_default(),
        });
        Ok(())
    }
}

fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

impl Cluster for FakeCluster {
    fn host(&self) -> &str {
        &self.host
    }

    async fn has_kind(&self, group: &str, kind: &str) -> bool {
        self.served.contains(&(group.to_string(), kind.to_string()))
    }

    async fn api_types(&self) -> Result<ApiTypes, Error> {
        Ok(self.api_types.clone())
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Result<Vec<K>, Error> {
        let (group, kind) = (K::group(&()).into_owned(), K::kind(&()).into_owned());
        if self.unserved.contains(&(group.clone(), kind.clone())) {
            return Err(Error::NoKind { group, kind });
        }

        let objects = self.objects.lock().unwrap();
        let mut items = Vec::new();
        for ((g, k, ns, _), value) in objects.iter() {
            if *g != group || *k != kind {
                continue;
            }
            if namespace.is_some() && ns.as_deref() != namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if let Some(selector) = selector {
                let labels = obj.meta().labels.clone().unwrap_or_default();
                if !selector.matches(&labels) {
                    continue;
                }
            }
            items.push(obj);
        }
        Ok(items)
    }

    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, Error> {
        Ok(self.object(namespace, name))
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, Error> {
        // Queries are answered, not stored.
        if K::kind(&()) == "ResourceQuery" {
            let mut value = serde_json::to_value(obj)?;
            if let Some(response) = self.query_response.clone() {
                value["response"] = response;
            }
            return Ok(serde_json::from_value(value)?);
        }

        let name = obj.meta().name.as_deref().unwrap_or_default();
        if self.object::<K>(obj.meta().namespace.as_deref(), name).is_some() {
            return Err(api_error(409, "AlreadyExists", "object already exists"));
        }
        self.record("create", obj)?;

        let mut created = obj.clone();
        let uid = {
            let mut next = self.next_uid.lock().unwrap();
            *next += 1;
            *next
        };
        created.meta_mut().uid = Some(format!("uid-{uid}"));
        created.meta_mut().resource_version = Some("1".to_string());

        self.insert(&created);
        Ok(created)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let name = obj.meta().name.as_deref().unwrap_or_default();
        let current = self
            .object::<K>(obj.meta().namespace.as_deref(), name)
            .ok_or_else(|| api_error(404, "NotFound", "object not found"))?;
        if obj.meta().resource_version != current.meta().resource_version {
            return Err(api_error(409, "Conflict", "the object has been modified"));
        }
        self.record("replace", obj)?;

        let mut replaced = obj.clone();
        let version = current
            .meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        replaced.meta_mut().resource_version = Some((version + 1).to_string());
        self.insert(&replaced);
        Ok(replaced)
    }

    async fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        _plural: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        if self
            .unserved
            .contains(&(gvk.group.clone(), gvk.kind.clone()))
        {
            return Err(Error::NoKind {
                group: gvk.group.clone(),
                kind: gvk.kind.clone(),
            });
        }
        Ok(self
            .dynamic
            .iter()
            .filter(|((g, k, ns), _)| {
                *g == gvk.group
                    && *k == gvk.kind
                    && (namespace.is_none() || ns.as_deref() == namespace)
            })
            .flat_map(|(_, objs)| objs.iter().cloned())
            .collect())
    }
}
