use super::{ApiTypes, Cluster, Error, Object};
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, Selector, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};

/// A [`Cluster`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    host: String,
}

impl KubeCluster {
    pub fn new(client: Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    /// Obtains the underlying Kubernetes client.
    #[inline]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        self.dynamic_api(&ApiResource::erase::<K>(&()), namespace)
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject, Error> {
        serde_json::from_value(serde_json::to_value(obj)?).map_err(Into::into)
    }

    fn from_dynamic<K: Object>(mut obj: DynamicObject) -> Result<K, Error> {
        // List items are returned without type information.
        obj.types = Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
        serde_json::from_value(serde_json::to_value(obj)?).map_err(Into::into)
    }

    fn no_kind(error: kube::Error, group: &str, kind: &str) -> Error {
        match error {
            kube::Error::Api(rsp) if rsp.code == 404 => Error::NoKind {
                group: group.to_string(),
                kind: kind.to_string(),
            },
            error => error.into(),
        }
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Cluster for KubeCluster {
    fn host(&self) -> &str {
        &self.host
    }

    async fn has_kind(&self, group: &str, kind: &str) -> bool {
        let discovery = match Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await
        {
            Ok(discovery) => discovery,
            Err(error) => {
                tracing::debug!(%error, %group, %kind, "Discovery failed");
                return false;
            }
        };
        let found = discovery
            .groups()
            .flat_map(|g| g.recommended_resources())
            .any(|(ar, _)| ar.kind == kind);
        found
    }

    async fn api_types(&self) -> Result<ApiTypes, Error> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut types = ApiTypes::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    types.insert(
                        &ar.group,
                        &ar.version,
                        &ar.kind,
                        &ar.plural,
                        matches!(caps.scope, Scope::Namespaced),
                    );
                }
            }
        }
        Ok(types)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Result<Vec<K>, Error> {
        let params = match selector {
            Some(selector) => ListParams::default().labels_from(selector),
            None => ListParams::default(),
        };
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| Self::no_kind(e, &K::group(&()), &K::kind(&())))?;
        list.items.into_iter().map(Self::from_dynamic).collect()
    }

    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, Error> {
        match self.api::<K>(namespace).get_opt(name).await? {
            Some(obj) => Self::from_dynamic(obj).map(Some),
            None => Ok(None),
        }
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let created = self
            .api::<K>(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), &Self::to_dynamic(obj)?)
            .await?;
        Self::from_dynamic(created)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let name = obj.meta().name.as_deref().ok_or_else(|| Error::MissingName {
            kind: K::kind(&()).into_owned(),
        })?;
        let replaced = self
            .api::<K>(obj.meta().namespace.as_deref())
            .replace(name, &PostParams::default(), &Self::to_dynamic(obj)?)
            .await?;
        Self::from_dynamic(replaced)
    }

    async fn list_dynamic(
        &self,
        gvk: &GroupVersionKind,
        plural: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let resource = ApiResource::from_gvk_with_plural(gvk, plural);
        let list = self
            .dynamic_api(&resource, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::no_kind(e, &gvk.group, &gvk.kind))?;
        Ok(list.items)
    }
}
