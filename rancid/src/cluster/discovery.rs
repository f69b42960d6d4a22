use serde::Serialize;
use std::{cmp::Ordering, collections::BTreeMap};

/// A kind served by the API server, with every version it is served at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiType {
    pub group: String,
    pub kind: String,
    /// The plural resource name used in URLs.
    pub resource: String,
    /// Served versions, highest priority first.
    pub versions: Vec<String>,
    pub namespaced: bool,
}

/// The API server's catalog of kinds, keyed by group and kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ApiTypes(BTreeMap<String, ApiType>);

// === impl ApiType ===

impl ApiType {
    /// The highest-priority served version.
    pub fn preferred_version(&self) -> Option<&str> {
        self.versions.first().map(String::as_str)
    }
}

// === impl ApiTypes ===

impl ApiTypes {
    /// Records that `group/version` serves `kind` as `resource`.
    ///
    /// Subresources (e.g. `pods/log`) are ignored.
    pub fn insert(
        &mut self,
        group: &str,
        version: &str,
        kind: &str,
        resource: &str,
        namespaced: bool,
    ) {
        if resource.contains('/') {
            return;
        }

        let ty = self
            .0
            .entry(Self::key(group, kind))
            .or_insert_with(|| ApiType {
                group: group.to_string(),
                kind: kind.to_string(),
                resource: resource.to_string(),
                versions: Vec::new(),
                namespaced,
            });
        if !ty.versions.iter().any(|v| v == version) {
            ty.versions.push(version.to_string());
            ty.versions.sort_by(|a, b| compare_versions(a, b));
        }
    }

    pub fn get(&self, group: &str, kind: &str) -> Option<&ApiType> {
        self.0.get(&Self::key(group, kind))
    }

    /// Every kind served in `group`, ordered by kind.
    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a ApiType> + 'a {
        self.0.values().filter(move |ty| ty.group == group)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiType> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn key(group: &str, kind: &str) -> String {
        if group.is_empty() {
            kind.to_string()
        } else {
            format!("{kind}.{group}")
        }
    }
}

/// Orders Kubernetes API versions by priority, highest first.
///
/// GA versions precede beta versions, which precede alpha versions. Within a
/// stability level, higher major and then higher minor versions come first.
/// Versions that don't follow the `vN[alpha|beta]M` convention come last, in
/// lexical order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// (stability, major, minor), where a larger tuple has a higher priority.
fn parse_version(v: &str) -> Option<(u8, u32, u32)> {
    let rest = v.strip_prefix('v')?;
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let major = rest[..digits].parse().ok()?;
    match &rest[digits..] {
        "" => Some((2, major, 0)),
        suffix => {
            let (stability, minor) = if let Some(minor) = suffix.strip_prefix("beta") {
                (1, minor)
            } else if let Some(minor) = suffix.strip_prefix("alpha") {
                (0, minor)
            } else {
                return None;
            };
            Some((stability, major, minor.parse().ok()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_versions_by_priority() {
        let mut versions = vec![
            "v1alpha1", "v2beta1", "foo10", "v1", "v11beta2", "v10beta3", "v2", "v3beta1",
            "v12alpha1", "foo1", "v11alpha2", "v10",
        ];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(
            versions,
            vec![
                "v10", "v2", "v1", "v11beta2", "v10beta3", "v3beta1", "v2beta1", "v12alpha1",
                "v11alpha2", "v1alpha1", "foo1", "foo10",
            ]
        );
    }

    #[test]
    fn merges_versions_of_a_kind() {
        let mut types = ApiTypes::default();
        types.insert("batch", "v1beta1", "CronJob", "cronjobs", true);
        types.insert("batch", "v1", "CronJob", "cronjobs", true);
        types.insert("batch", "v1", "CronJob", "cronjobs/status", true);
        types.insert("", "v1", "Pod", "pods", true);

        let cronjob = types.get("batch", "CronJob").expect("cronjob");
        assert_eq!(cronjob.versions, vec!["v1", "v1beta1"]);
        assert_eq!(cronjob.preferred_version(), Some("v1"));
        assert_eq!(types.len(), 2);
        assert_eq!(
            types.in_group("").map(|t| t.kind.as_str()).collect::<Vec<_>>(),
            vec!["Pod"]
        );
    }
}
