//! Reconciles BOSH deployment manifests into Kubernetes workloads.
//!
//! A [`crd::BoshDeployment`] passes through a pipeline of independent control loops. Each stage
//! writes a versioned [`artifact`] that triggers the next one: the manifest with ops files
//! applied, the desired manifest with variables interpolated, and per instance group the
//! resolved properties and BPM configuration, which are finally converted into workloads.

pub mod apply;
pub mod artifact;
pub mod bpm;
pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod kvp;
pub mod links;
pub mod manifest;
pub mod meltdown;
pub mod name_service;
pub mod reconcile;
pub mod references;
pub mod release;
pub mod render;
pub mod resolver;
pub mod status;
pub mod store;
pub mod telemetry;

// External re-exports
pub use k8s_openapi;
pub use kube;
