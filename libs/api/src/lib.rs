//! # sandbox-api
//!
//! Resource types and collaborator seams for the sandbox controller.
//!
//! ## Resources
//!
//! - [`Pool`]: keeps a standing buffer of pre-warmed pods.
//! - [`BatchSandbox`]: a batch of N replicas drawn from a pool or created
//!   directly from a template, each optionally running a derived [`Task`].
//!
//! ## Seams
//!
//! The controller never talks to the cluster directly. It reads through a
//! [`ResourceCache`] (an eventually consistent snapshot store) and writes
//! through a [`ClusterClient`]. Objects handed out by the cache are shared
//! immutable snapshots; mutations always go through the client.

mod cache;
mod client;
mod error;
mod key;
pub mod labels;
mod selector;
mod types;

pub use cache::ResourceCache;
pub use client::{ClusterClient, Preconditions};
pub use error::ClusterError;
pub use key::{ObjectKey, ResourceKind};
pub use selector::LabelSelector;
pub use types::*;

/// Re-export of the core/v1 types the resources embed.
pub use k8s_openapi::api::core::v1::{EnvVar, Pod, PodTemplateSpec};
