//! Rancher-aware project and monitoring utilities built on [`kube`]
//!
//! `rancid` groups a cluster's namespaces into Rancher-style projects,
//! decides which Prometheus instance is the cluster default, federates
//! `ServiceMonitor`s into project-scoped Prometheus namespaces, and computes
//! resource-quota usage per project.
//!
//! Every component is written against the [`Cluster`] capability rather than
//! a concrete client. [`ClientArgs`] builds the production implementation,
//! [`KubeCluster`], once per process.
//!
//! # Crate Features
//!
//! - **clap**: Implements [`clap::Args`] for [`ClientArgs`] and `LogArgs`, and
//!   [`clap::ValueEnum`] for `LogFormat`.
//! - **errors**: Enables the [`errors`] module.
//! - **log**: Enables the [`log`] module.
//! - **shutdown**: Enables the [`shutdown`] module.
//! - **rustls-tls** / **openssl-tls**: Selects the TLS implementation used by
//!   the underlying [`kube`] client.
//!
//! [`kube`]: https://github.com/kube-rs/kube-rs
//! [`clap::Args`]: https://docs.rs/clap/4/clap/trait.Args.html
//! [`clap::ValueEnum`]: https://docs.rs/clap/4/clap/trait.ValueEnum.html

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod apis;
pub mod client;
pub mod cluster;
pub mod federation;
pub mod manager;
pub mod metrics;
pub mod monitoring;
pub mod project;
pub mod quantity;
pub mod quota;
pub mod topology;

#[cfg(feature = "errors")]
#[cfg_attr(docsrs, doc(cfg(feature = "errors")))]
pub mod errors;

#[cfg(feature = "log")]
#[cfg_attr(docsrs, doc(cfg(feature = "log")))]
pub mod log;

#[cfg(feature = "shutdown")]
#[cfg_attr(docsrs, doc(cfg(feature = "shutdown")))]
pub mod shutdown;

pub use self::client::ClientArgs;
pub use self::cluster::{create_or_patch, Cluster, KubeCluster, Verb};
pub use self::manager::ClusterManager;
pub use self::project::{Project, ProjectType};

#[cfg(feature = "log")]
pub use self::log::{LogArgs, LogFilter, LogFormat, LogInitError};
