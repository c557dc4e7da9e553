//! Blob REST lease client.
//!
//! Lock objects are zero-length blobs under `{container}/{locks_prefix}/`,
//! and exclusivity comes from the store's native blob-lease operations
//! (`?comp=lease` with `x-ms-lease-action`). Authentication uses a SAS
//! token appended to every request's query string; shared-key signing is
//! intentionally not implemented here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProviderError, RenewError};
use crate::providers::traits::{AcquireOutcome, CreateOutcome, LeaseProvider};
use crate::scope::{lease_blob_path, LockId};

/// Service protocol version sent with every request.
const API_VERSION: &str = "2021-12-02";

/// Default per-request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const HDR_VERSION: &str = "x-ms-version";
const HDR_BLOB_TYPE: &str = "x-ms-blob-type";
const HDR_LEASE_ACTION: &str = "x-ms-lease-action";
const HDR_LEASE_ID: &str = "x-ms-lease-id";
const HDR_PROPOSED_LEASE_ID: &str = "x-ms-proposed-lease-id";
const HDR_LEASE_DURATION: &str = "x-ms-lease-duration";
const HDR_LEASE_STATE: &str = "x-ms-lease-state";
const HDR_ERROR_CODE: &str = "x-ms-error-code";
const HDR_META_OWNER: &str = "x-ms-meta-owner";

/// Configuration for the blob lease backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobLeaseConfig {
    /// Blob service endpoint, e.g. `https://account.blob.core.windows.net`.
    pub endpoint: String,
    /// Container holding the lock blobs.
    pub container: String,
    /// Path prefix for lock blobs within the container.
    pub locks_prefix: String,
    /// SAS token granting read/write/lease on the container, with or
    /// without the leading `?`.
    pub sas_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl BlobLeaseConfig {
    /// Configuration with the conventional locks prefix and timeout.
    pub fn new(endpoint: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            container: container.into(),
            locks_prefix: "locks".to_string(),
            sas_token: None,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Attach a SAS token.
    #[must_use]
    pub fn with_sas_token(mut self, token: impl Into<String>) -> Self {
        self.sas_token = Some(token.into());
        self
    }
}

/// Blob-store lease provider.
#[derive(Debug, Clone)]
pub struct BlobLeaseProvider {
    client: Client,
    config: BlobLeaseConfig,
}

impl BlobLeaseProvider {
    /// Build the provider and its HTTP client.
    ///
    /// # Errors
    /// Returns `ProviderError` if the endpoint is empty or the HTTP client
    /// cannot be constructed.
    pub fn new(config: BlobLeaseConfig) -> Result<Self, ProviderError> {
        if config.endpoint.is_empty() || config.container.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "blob endpoint and container must be set".to_string(),
            ));
        }
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn blob_url(&self, lock_id: &LockId, comp: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.container,
            lease_blob_path(&self.config.locks_prefix, lock_id),
        );
        let mut sep = '?';
        if let Some(comp) = comp {
            url.push(sep);
            url.push_str("comp=");
            url.push_str(comp);
            sep = '&';
        }
        if let Some(sas) = &self.config.sas_token {
            url.push(sep);
            url.push_str(sas.trim_start_matches('?'));
        }
        url
    }

    fn container_url(&self) -> String {
        let mut url = format!(
            "{}/{}?restype=container",
            self.config.endpoint.trim_end_matches('/'),
            self.config.container,
        );
        if let Some(sas) = &self.config.sas_token {
            url.push('&');
            url.push_str(sas.trim_start_matches('?'));
        }
        url
    }

    async fn lease_action(
        &self,
        lock_id: &LockId,
        action: &str,
        lease_id: Option<&str>,
        period: Option<Duration>,
        proposed: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        let mut request = self
            .client
            .put(self.blob_url(lock_id, Some("lease")))
            .header(HDR_VERSION, API_VERSION)
            .header(HDR_LEASE_ACTION, action)
            .header(CONTENT_LENGTH, "0");
        if let Some(id) = lease_id {
            request = request.header(HDR_LEASE_ID, id);
        }
        if let Some(period) = period {
            request = request.header(HDR_LEASE_DURATION, period.as_secs().to_string());
        }
        if let Some(proposed) = proposed {
            request = request.header(HDR_PROPOSED_LEASE_ID, proposed);
        }
        request.send().await
    }

    /// Create the container; an existing container is fine.
    async fn ensure_container(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.container_url())
            .header(HDR_VERSION, API_VERSION)
            .header(CONTENT_LENGTH, "0")
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            _ => Err(api_error(&response)),
        }
    }

    async fn put_lock_blob(&self, lock_id: &LockId) -> Result<Response, reqwest::Error> {
        self.client
            .put(self.blob_url(lock_id, None))
            .header(HDR_VERSION, API_VERSION)
            .header(HDR_BLOB_TYPE, "BlockBlob")
            .header(IF_NONE_MATCH, "*")
            .header(CONTENT_LENGTH, "0")
            .send()
            .await
    }
}

fn error_code(response: &Response) -> String {
    response
        .headers()
        .get(HDR_ERROR_CODE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn api_error(response: &Response) -> ProviderError {
    let status = response.status();
    ProviderError::Api {
        status: status.as_u16(),
        code: error_code(response),
        message: status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string(),
    }
}

fn classify_create(status: StatusCode) -> Option<CreateOutcome> {
    match status {
        StatusCode::CREATED => Some(CreateOutcome::Created),
        // 409 and 412 both mean we lost the creation race.
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Some(CreateOutcome::NotCreated),
        _ => None,
    }
}

#[async_trait]
impl LeaseProvider for BlobLeaseProvider {
    async fn create_if_absent(&self, lock_id: &LockId) -> Result<CreateOutcome, ProviderError> {
        let response = self.put_lock_blob(lock_id).await?;
        if let Some(outcome) = classify_create(response.status()) {
            return Ok(outcome);
        }
        if response.status() == StatusCode::NOT_FOUND {
            // Container itself is missing; create it and retry the blob once.
            self.ensure_container().await?;
            let retry = self.put_lock_blob(lock_id).await?;
            return classify_create(retry.status()).ok_or_else(|| api_error(&retry));
        }
        Err(api_error(&response))
    }

    async fn try_acquire(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed_lease_id: Option<&str>,
    ) -> Result<AcquireOutcome, ProviderError> {
        let response = self
            .lease_action(lock_id, "acquire", None, Some(period), proposed_lease_id)
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                let lease_id = response
                    .headers()
                    .get(HDR_LEASE_ID)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| ProviderError::Api {
                        status: 201,
                        code: String::new(),
                        message: "acquire response missing lease id".to_string(),
                    })?;
                debug!(lock_id = %lock_id, "blob lease acquired");
                Ok(AcquireOutcome::Acquired(lease_id))
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(AcquireOutcome::Conflict),
            StatusCode::NOT_FOUND => Ok(AcquireOutcome::NotFound),
            _ => Err(api_error(&response)),
        }
    }

    async fn renew(&self, lock_id: &LockId, lease_id: &str) -> Result<(), RenewError> {
        let response = self
            .lease_action(lock_id, "renew", Some(lease_id), None, None)
            .await
            .map_err(|err| RenewError::Transient {
                code: "Network".to_string(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let code = error_code(&response);
        if status.is_server_error() {
            Err(RenewError::Transient {
                code,
                message: format!("renewal failed with status {status}"),
            })
        } else {
            Err(RenewError::Lost {
                code,
                message: format!("renewal rejected with status {status}"),
            })
        }
    }

    async fn release(&self, lock_id: &LockId, lease_id: &str) -> Result<(), ProviderError> {
        let response = self
            .lease_action(lock_id, "release", Some(lease_id), None, None)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                // Expired, broken, or re-acquired by someone else; nothing
                // meaningful left to release.
                debug!(lock_id = %lock_id, "blob lease already gone on release");
                Ok(())
            }
            _ => Err(api_error(&response)),
        }
    }

    async fn owner(&self, lock_id: &LockId) -> Result<Option<String>, ProviderError> {
        let response = self
            .client
            .head(self.blob_url(lock_id, None))
            .header(HDR_VERSION, API_VERSION)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let leased = response
                    .headers()
                    .get(HDR_LEASE_STATE)
                    .and_then(|value| value.to_str().ok())
                    .is_some_and(|state| state.eq_ignore_ascii_case("leased"));
                if !leased {
                    return Ok(None);
                }
                Ok(response
                    .headers()
                    .get(HDR_META_OWNER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string))
            }
            _ => Err(api_error(&response)),
        }
    }

    async fn set_owner(
        &self,
        lock_id: &LockId,
        lease_id: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.blob_url(lock_id, Some("metadata")))
            .header(HDR_VERSION, API_VERSION)
            .header(HDR_LEASE_ID, lease_id)
            .header(HDR_META_OWNER, owner)
            .header(CONTENT_LENGTH, "0")
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND
            | StatusCode::CONFLICT
            | StatusCode::PRECONDITION_FAILED => {
                // Metadata is diagnostic only; losing this write is fine.
                warn!(lock_id = %lock_id, status = %response.status(), "owner metadata write skipped");
                Ok(())
            }
            _ => Err(api_error(&response)),
        }
    }
}
