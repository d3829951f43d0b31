//! KVM operator - node lifecycle and network identity for KVM-hosted clusters
//!
//! Each workload cluster runs its nodes as Pods in a management namespace
//! named after the cluster ID. This crate keeps those Pods, the workload
//! cluster's Nodes and the Endpoints that route traffic to them consistent.
//!
//! # Modules
//!
//! - [`crd`] - KvmCluster and DrainerConfig custom resources
//! - [`controller`] - KvmCluster and Pod controllers
//! - [`nodeindex`] - Stable per-node index allocation
//! - [`nodecontroller`] - Per-cluster workload Node loops and readiness propagation
//! - [`endpoints`] - Endpoints maintenance and stale address sweeping
//! - [`drain`] - Drain handshake for deleted node Pods
//! - [`workload`] - Workload cluster API clients built from certificate Secrets
//! - [`key`] - Label, annotation and condition names plus object accessors
//! - [`outcome`] - Step outcomes shared by the components
//! - [`retry`] - Retry with exponential backoff
//! - [`config`] - Operator settings
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod drain;
pub mod endpoints;
pub mod error;
pub mod key;
pub mod nodecontroller;
pub mod nodeindex;
pub mod outcome;
pub mod retry;
pub mod telemetry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
