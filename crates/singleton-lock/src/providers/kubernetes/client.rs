//! coordination.k8s.io/v1 Lease client.
//!
//! One Lease object per lock. Acquisition claims `holderIdentity` with a
//! fresh token through a `resourceVersion`-guarded replace, so two nodes can
//! never both believe they won. Expiry is judged from
//! `renewTime + leaseDurationSeconds` against the local clock; release
//! clears `holderIdentity` rather than deleting the object, because a
//! delete could remove a lease another node acquired between our read and
//! the write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ProviderError, RenewError};
use crate::providers::traits::{AcquireOutcome, CreateOutcome, LeaseProvider};
use crate::scope::{k8s_lease_name, LockId};

/// Annotation carrying the diagnostic owner tag.
const OWNER_ANNOTATION: &str = "singleton-lock.io/owner";

/// Configuration for the Kubernetes lease backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesLeaseConfig {
    /// Namespace holding the Lease objects.
    pub namespace: String,
    /// Prefix prepended to sanitized lock ids when naming Lease objects.
    pub lease_prefix: String,
}

impl KubernetesLeaseConfig {
    /// Configuration with the conventional lease-name prefix.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            lease_prefix: "lock".to_string(),
        }
    }
}

/// Kubernetes Lease provider.
pub struct KubernetesLeaseProvider {
    api: Api<Lease>,
    config: KubernetesLeaseConfig,
}

impl KubernetesLeaseProvider {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    ///
    /// # Errors
    /// Returns `ProviderError::Kube` if client inference fails.
    pub async fn connect(config: KubernetesLeaseConfig) -> Result<Self, ProviderError> {
        let client = Client::try_default()
            .await
            .map_err(ProviderError::Kube)?;
        Ok(Self::with_client(client, config))
    }

    /// Build the provider over an existing client.
    #[must_use]
    pub fn with_client(client: Client, config: KubernetesLeaseConfig) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self { api, config }
    }

    fn lease_name(&self, lock_id: &LockId) -> String {
        format!("{}-{}", self.config.lease_prefix, k8s_lease_name(lock_id))
    }
}

fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn lease_expired(spec: &LeaseSpec, now: chrono::DateTime<Utc>) -> bool {
    let Some(renew_time) = spec.renew_time.as_ref() else {
        return true;
    };
    let period = i64::from(spec.lease_duration_seconds.unwrap_or(0).max(0));
    renew_time.0 + chrono::Duration::seconds(period) <= now
}

fn classify_renew(err: &kube::Error, context: &str) -> RenewError {
    match api_status(err) {
        Some(status) if status >= 500 => RenewError::Transient {
            code: status.to_string(),
            message: format!("{context}: {err}"),
        },
        Some(status) => RenewError::Lost {
            code: status.to_string(),
            message: format!("{context}: {err}"),
        },
        // No HTTP status means we never reached the API server; retry
        // sooner rather than giving the lease up.
        None => RenewError::Transient {
            code: "Network".to_string(),
            message: format!("{context}: {err}"),
        },
    }
}

#[async_trait]
impl LeaseProvider for KubernetesLeaseProvider {
    async fn create_if_absent(&self, lock_id: &LockId) -> Result<CreateOutcome, ProviderError> {
        let name = self.lease_name(lock_id);
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec::default()),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                debug!(lock_id = %lock_id, lease = %name, "lease object created");
                Ok(CreateOutcome::Created)
            }
            Err(err) if api_status(&err) == Some(409) => Ok(CreateOutcome::NotCreated),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_acquire(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed_lease_id: Option<&str>,
    ) -> Result<AcquireOutcome, ProviderError> {
        let name = self.lease_name(lock_id);
        let Some(mut lease) = self.api.get_opt(&name).await? else {
            return Ok(AcquireOutcome::NotFound);
        };

        let now = Utc::now();
        if let Some(spec) = lease.spec.as_ref() {
            if spec.holder_identity.is_some() && !lease_expired(spec, now) {
                return Ok(AcquireOutcome::Conflict);
            }
        }

        let lease_id = proposed_lease_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let transitions = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0);
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(lease_id.clone()),
            lease_duration_seconds: Some(period.as_secs().min(i32::MAX as u64) as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions + 1),
            ..Default::default()
        });

        // resourceVersion from the read guards the replace: losing the race
        // comes back as a 409, never as a double acquisition.
        match self.api.replace(&name, &PostParams::default(), &lease).await {
            Ok(_) => {
                debug!(lock_id = %lock_id, lease = %name, "kubernetes lease acquired");
                Ok(AcquireOutcome::Acquired(lease_id))
            }
            Err(err) if api_status(&err) == Some(409) => Ok(AcquireOutcome::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    async fn renew(&self, lock_id: &LockId, lease_id: &str) -> Result<(), RenewError> {
        let name = self.lease_name(lock_id);
        let fetched = self
            .api
            .get_opt(&name)
            .await
            .map_err(|err| classify_renew(&err, "reading lease for renewal"))?;
        let Some(mut lease) = fetched else {
            return Err(RenewError::Lost {
                code: "NotFound".to_string(),
                message: format!("lease object for lock '{lock_id}' is gone"),
            });
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref());
        if holder != Some(lease_id) {
            return Err(RenewError::Lost {
                code: "LeaseIdMismatch".to_string(),
                message: format!("lock '{lock_id}' is held by a different identity"),
            });
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.api
            .replace(&name, &PostParams::default(), &lease)
            .await
            .map_err(|err| match api_status(&err) {
                // A CAS conflict on our own renewal means someone claimed
                // the lease between our read and write.
                Some(409 | 412) => RenewError::Lost {
                    code: "Conflict".to_string(),
                    message: format!("lease for lock '{lock_id}' changed hands: {err}"),
                },
                _ => classify_renew(&err, "writing renewed lease"),
            })?;
        Ok(())
    }

    async fn release(&self, lock_id: &LockId, lease_id: &str) -> Result<(), ProviderError> {
        let name = self.lease_name(lock_id);
        let Some(mut lease) = self.api.get_opt(&name).await? else {
            return Ok(());
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref());
        if holder != Some(lease_id) {
            debug!(lock_id = %lock_id, "lease already held elsewhere on release");
            return Ok(());
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.acquire_time = None;
            spec.renew_time = None;
        }
        match self.api.replace(&name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            Err(err) if matches!(api_status(&err), Some(409 | 412)) => {
                debug!(lock_id = %lock_id, "lease re-acquired before release completed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn owner(&self, lock_id: &LockId) -> Result<Option<String>, ProviderError> {
        let name = self.lease_name(lock_id);
        let Some(lease) = self.api.get_opt(&name).await? else {
            return Ok(None);
        };
        let held = lease
            .spec
            .as_ref()
            .is_some_and(|spec| spec.holder_identity.is_some() && !lease_expired(spec, Utc::now()));
        if !held {
            return Ok(None);
        }
        Ok(lease
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(OWNER_ANNOTATION))
            .cloned())
    }

    async fn set_owner(
        &self,
        lock_id: &LockId,
        lease_id: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        let name = self.lease_name(lock_id);
        let Some(lease) = self.api.get_opt(&name).await? else {
            return Ok(());
        };
        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref());
        if holder != Some(lease_id) {
            debug!(lock_id = %lock_id, "skipping owner tag, lease not ours");
            return Ok(());
        }
        let patch = json!({
            "metadata": {
                "annotations": { OWNER_ANNOTATION: owner }
            }
        });
        match self
            .api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if matches!(api_status(&err), Some(404 | 409 | 412)) => {
                warn!(lock_id = %lock_id, "owner metadata write lost a race, skipping");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_judged_from_renew_time_plus_duration() {
        let now = Utc::now();
        let spec = LeaseSpec {
            holder_identity: Some("abc".to_string()),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(10))),
            ..Default::default()
        };
        assert!(!lease_expired(&spec, now));

        let stale = LeaseSpec {
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(31))),
            ..spec.clone()
        };
        assert!(lease_expired(&stale, now));

        // Never renewed counts as expired.
        assert!(lease_expired(&LeaseSpec::default(), now));
    }

    #[test]
    fn renew_classification_splits_server_side_from_fatal() {
        let gone = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(!classify_renew(&gone, "test").is_transient());

        let flaky = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        });
        assert!(classify_renew(&flaky, "test").is_transient());
    }
}
