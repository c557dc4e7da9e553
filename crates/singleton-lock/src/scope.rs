//! Lock identifiers and backing-store naming conventions.
//!
//! A lock id is a string key, unique within an (account, namespace) pair.
//! Two conventional shapes exist: function-scoped ids
//! (`{declaring_type}.{method}.{scope_id}`) and host-scoped ids
//! (`{account}/{qualifier}.{scope_id}`). Backends derive their own object
//! names from the id: the blob backend nests it under a locks prefix, the
//! Kubernetes backend sanitizes it into a DNS-1123 label.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Maximum length of a Kubernetes Lease object name.
const K8S_NAME_MAX: usize = 63;

/// Hex characters of the hash suffix appended to sanitized names.
const K8S_HASH_LEN: usize = 8;

/// String key addressing a lease in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    /// Create a lock id from a raw string key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for LockId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// How a lock id is scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    /// Unique per function method, optionally qualified by a scope id.
    Function {
        /// Type declaring the method.
        declaring_type: String,
        /// Method name.
        method: String,
        /// Optional invocation-scope qualifier.
        scope_id: Option<String>,
    },
    /// Shared host-wide under an explicit scope id.
    Host {
        /// Storage account name.
        account: String,
        /// Scope qualifier (e.g. a host id).
        qualifier: String,
        /// Explicit scope id.
        scope_id: String,
    },
}

impl LockScope {
    /// Render this scope as a lock id.
    #[must_use]
    pub fn lock_id(&self) -> LockId {
        match self {
            Self::Function {
                declaring_type,
                method,
                scope_id,
            } => match scope_id.as_deref() {
                Some(scope) if !scope.is_empty() => {
                    LockId(format!("{declaring_type}.{method}.{scope}"))
                }
                _ => LockId(format!("{declaring_type}.{method}")),
            },
            Self::Host {
                account,
                qualifier,
                scope_id,
            } => LockId(format!("{account}/{qualifier}.{scope_id}")),
        }
    }
}

/// Blob path for a lock object: `{locks_prefix}/{lock_id}`.
///
/// The container name is part of the provider configuration, so the path
/// returned here is container-relative.
#[must_use]
pub fn lease_blob_path(locks_prefix: &str, lock_id: &LockId) -> String {
    let prefix = locks_prefix.trim_matches('/');
    if prefix.is_empty() {
        lock_id.as_str().to_string()
    } else {
        format!("{prefix}/{}", lock_id)
    }
}

/// Sanitize a lock id into a valid Kubernetes Lease object name.
///
/// Names that are already lowercase DNS-1123 labels pass through unchanged.
/// Anything else is lowercased, has invalid characters collapsed to `-`, is
/// truncated, and gets a short content hash appended so distinct lock ids
/// never collide after sanitization.
#[must_use]
pub fn k8s_lease_name(lock_id: &LockId) -> String {
    let raw = lock_id.as_str();
    let lowered: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name = lowered.trim_matches('-').to_string();

    if name == raw && !name.is_empty() && name.len() <= K8S_NAME_MAX {
        return name;
    }

    let digest = hex::encode(Sha1::digest(raw.as_bytes()));
    let hash = &digest[..K8S_HASH_LEN];
    let keep = K8S_NAME_MAX - K8S_HASH_LEN - 1;
    if name.len() > keep {
        name.truncate(keep);
    }
    let name = name.trim_matches('-');
    if name.is_empty() {
        format!("lock-{hash}")
    } else {
        format!("{name}-{hash}")
    }
}
