//! Kubernetes Lease backend.

mod client;

pub use client::{KubernetesLeaseConfig, KubernetesLeaseProvider};
