//! Lease-provider abstractions over the supported backing stores.

pub mod blob;
pub mod kubernetes;
pub mod memory;
mod traits;

use std::sync::Arc;

pub use blob::{BlobLeaseConfig, BlobLeaseProvider};
pub use kubernetes::{KubernetesLeaseConfig, KubernetesLeaseProvider};
pub use memory::MemoryLeaseProvider;
pub use traits::{AcquireOutcome, CreateOutcome, LeaseProvider};

use crate::error::ProviderError;

/// Backing store selected when constructing a lock manager.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Blob-store leases over the blob REST protocol.
    Blob(BlobLeaseConfig),
    /// Kubernetes coordination.k8s.io Lease objects.
    Kubernetes(KubernetesLeaseConfig),
    /// In-process store for tests.
    Memory,
}

impl Backend {
    /// Build and connect the provider for this backend.
    ///
    /// # Errors
    /// Returns `ProviderError` if the underlying client cannot be
    /// constructed (bad endpoint, unreachable Kubernetes API).
    pub async fn connect(self) -> Result<Arc<dyn LeaseProvider>, ProviderError> {
        match self {
            Self::Blob(config) => Ok(Arc::new(BlobLeaseProvider::new(config)?)),
            Self::Kubernetes(config) => {
                Ok(Arc::new(KubernetesLeaseProvider::connect(config).await?))
            }
            Self::Memory => Ok(Arc::new(MemoryLeaseProvider::new())),
        }
    }
}
