//! Resource requests and limits of workload objects
//!
//! A workload's usage is that of one pod, multiplied by the number of pods
//! it asks for. A pod uses the larger of its containers' sum and each init
//! container, plus the runtime's overhead.

use crate::{
    apis::management::ResourceList,
    quantity::{Amount, Format, ParseError},
};
use k8s_openapi::{
    api::core::v1::{Container, PodSpec},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::core::GroupVersionKind;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no resource calculator registered for {0}")]
    Unregistered(String),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Quantity(#[from] ParseError),

    #[error("resource usage overflows")]
    Overflow,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Shape {
    Pod,
    Replicated,
    DaemonSet,
    Job,
    CronJob,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Which {
    Requests,
    Limits,
}

type Usage = BTreeMap<String, Amount>;

fn shape(gvk: &GroupVersionKind) -> Option<Shape> {
    match (gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()) {
        ("", "v1", "Pod") => Some(Shape::Pod),
        ("apps", "v1", "Deployment" | "StatefulSet" | "ReplicaSet") => Some(Shape::Replicated),
        ("apps", "v1", "DaemonSet") => Some(Shape::DaemonSet),
        ("batch", "v1", "Job") => Some(Shape::Job),
        ("batch", "v1" | "v1beta1", "CronJob") => Some(Shape::CronJob),
        _ => None,
    }
}

/// Returns true if usage can be computed for objects of `gvk`.
pub fn is_registered(gvk: &GroupVersionKind) -> bool {
    shape(gvk).is_some()
}

/// Sums the resources requested by every pod the object runs.
pub fn resource_requests(gvk: &GroupVersionKind, obj: &Value) -> Result<ResourceList, Error> {
    workload_usage(gvk, obj, Which::Requests).map(render)
}

pub fn resource_limits(gvk: &GroupVersionKind, obj: &Value) -> Result<ResourceList, Error> {
    workload_usage(gvk, obj, Which::Limits).map(render)
}

/// Computes the object's quota usage, with requests keyed as `requests.<name>`
/// and limits as `limits.<name>`.
pub fn quota_usage(gvk: &GroupVersionKind, obj: &Value) -> Result<ResourceList, Error> {
    let requests = workload_usage(gvk, obj, Which::Requests)?;
    let limits = workload_usage(gvk, obj, Which::Limits)?;
    let prefixed = requests
        .into_iter()
        .map(|(name, q)| (format!("requests.{name}"), q))
        .chain(limits.into_iter().map(|(name, q)| (format!("limits.{name}"), q)))
        .collect();
    Ok(render(prefixed))
}

fn workload_usage(gvk: &GroupVersionKind, obj: &Value, which: Which) -> Result<Usage, Error> {
    let shape = shape(gvk).ok_or_else(|| {
        Error::Unregistered(format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind))
    })?;

    let (spec, replicas) = match shape {
        Shape::Pod => (decode(obj, "/spec")?, 1),
        Shape::Replicated => (
            decode(obj, "/spec/template/spec")?,
            decode(obj, "/spec/replicas")?.unwrap_or(1),
        ),
        Shape::DaemonSet => (
            decode(obj, "/spec/template/spec")?,
            decode(obj, "/status/desiredNumberScheduled")?.unwrap_or(1),
        ),
        Shape::Job => (
            decode(obj, "/spec/template/spec")?,
            decode(obj, "/spec/parallelism")?.unwrap_or(1),
        ),
        Shape::CronJob => (
            decode(obj, "/spec/jobTemplate/spec/template/spec")?,
            decode(obj, "/spec/jobTemplate/spec/parallelism")?.unwrap_or(1),
        ),
    };
    let Some(spec) = spec else {
        return Ok(Usage::new());
    };

    let per_pod = pod_usage(&spec, which)?;
    per_pod
        .into_iter()
        .map(|(name, amount)| {
            let total = amount.checked_mul(replicas).ok_or(Error::Overflow)?;
            Ok((name, total))
        })
        .collect()
}

fn decode<T: serde::de::DeserializeOwned>(
    obj: &Value,
    path: &'static str,
) -> Result<Option<T>, Error> {
    match obj.pointer(path) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| Error::Decode { path, source }),
    }
}

fn pod_usage(spec: &PodSpec, which: Which) -> Result<Usage, Error> {
    let mut usage = Usage::new();
    for container in &spec.containers {
        add(&mut usage, resources(container, which))?;
    }

    // Init containers run one at a time, before the app containers.
    for container in spec.init_containers.iter().flatten() {
        for (name, q) in resources(container, which).into_iter().flatten() {
            let amount = Amount::try_from(q)?;
            let current = usage.entry(name.clone()).or_default();
            if amount > *current {
                *current = amount;
            }
        }
    }

    if let Some(overhead) = spec.overhead.as_ref() {
        for (name, q) in overhead {
            // Overhead only raises limits the pod already declares.
            if which == Which::Limits && !usage.contains_key(name) {
                continue;
            }
            let sum = usage.entry(name.clone()).or_default();
            *sum = sum
                .checked_add(Amount::try_from(q)?)
                .ok_or(Error::Overflow)?;
        }
    }

    Ok(usage)
}

fn resources(container: &Container, which: Which) -> Option<&BTreeMap<String, Quantity>> {
    let resources = container.resources.as_ref()?;
    match which {
        Which::Requests => resources.requests.as_ref(),
        Which::Limits => resources.limits.as_ref(),
    }
}

fn add(usage: &mut Usage, list: Option<&BTreeMap<String, Quantity>>) -> Result<(), Error> {
    for (name, q) in list.into_iter().flatten() {
        let sum = usage.entry(name.clone()).or_default();
        *sum = sum
            .checked_add(Amount::try_from(q)?)
            .ok_or(Error::Overflow)?;
    }
    Ok(())
}

fn render(usage: Usage) -> ResourceList {
    usage
        .into_iter()
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(name, amount)| {
            let q = amount.to_quantity(Format::for_resource(&name));
            (name, q)
        })
        .collect()
}
