//! Installation lifecycle
//!
//! Handles the install/uninstall handshake with the host platform.
//!
//! ```text
//! UNINSTALLED ──install──▶ INSTALLED ──uninstall──▶ UNINSTALLED
//!                   ▲            │
//!                   └─reinstall──┘   (upsert, same id)
//! ```
//!
//! Mutations for one id are linearized on a per-id lock and run on a detached
//! task, so a host that hangs up mid-request cannot leave a write half done.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{Result, StorageError, ValidationError};
use crate::store::{string_or_number, Installation, SharedStore};

/// Body of the install callback.
///
/// Field names follow the host platform; several spellings are accepted and
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPayload {
    /// Installation id
    #[serde(default, alias = "oauthId", deserialize_with = "string_or_number")]
    pub id: Option<String>,
    /// Shared secret
    #[serde(default, alias = "oauthSecret", alias = "sharedSecret")]
    pub secret: Option<String>,
    /// REST API base URL
    #[serde(default, alias = "apiUrl")]
    pub api_base_url: Option<String>,
    /// OAuth token endpoint
    #[serde(default, alias = "tokenUrl")]
    pub oauth_token_url: Option<String>,
    /// Group scope
    #[serde(default, deserialize_with = "string_or_number")]
    pub group_id: Option<String>,
    /// Room scope
    #[serde(default, deserialize_with = "string_or_number")]
    pub room_id: Option<String>,
    /// Host capabilities document
    #[serde(default)]
    pub capabilities_url: Option<String>,
}

impl InstallPayload {
    /// Decode a raw request body
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, ValidationError> {
        serde_json::from_slice(bytes).map_err(|e| ValidationError::MalformedPayload(e.to_string()))
    }

    /// Check required fields and build the record to store
    pub fn validate(self) -> std::result::Result<Installation, ValidationError> {
        let id = verbatim("id", self.id)?;
        if id.contains('/') {
            return Err(ValidationError::MalformedPayload(
                "id must not contain '/'".to_string(),
            ));
        }

        let secret = verbatim("secret", self.secret)?;
        let api_base_url = required("apiBaseUrl", self.api_base_url)?;
        check_url("apiBaseUrl", &api_base_url)?;

        let oauth_token_url = optional(self.oauth_token_url);
        if let Some(url) = &oauth_token_url {
            check_url("oauthTokenUrl", url)?;
        }
        let capabilities_url = optional(self.capabilities_url);
        if let Some(url) = &capabilities_url {
            check_url("capabilitiesUrl", url)?;
        }

        Ok(Installation {
            id,
            secret,
            api_base_url,
            oauth_token_url,
            group_id: self.group_id,
            room_id: self.room_id,
            capabilities_url,
            installed_at: Utc::now(),
        })
    }
}

/// Credentials are stored exactly as sent; blank counts as missing
fn verbatim(
    field: &'static str,
    value: Option<String>,
) -> std::result::Result<String, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ValidationError::MissingField(field))
}

fn required(
    field: &'static str,
    value: Option<String>,
) -> std::result::Result<String, ValidationError> {
    optional(value).ok_or(ValidationError::MissingField(field))
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_url(field: &'static str, raw: &str) -> std::result::Result<(), ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::InvalidUrl {
            field,
            reason: format!("{raw} is not an absolute http(s) URL"),
        });
    }
    Ok(())
}

/// Per-key async locks, dropped from the table once idle.
#[derive(Debug, Default)]
struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<tokio::sync::Mutex<()>>,
    key: String,
    locks: Arc<KeyedLocks>,
}

impl KeyedLocks {
    async fn lock(self: &Arc<Self>, key: &str) -> KeyedGuard {
        let slot = self.slots.lock().entry(key.to_string()).or_default().clone();
        let guard = slot.clone().lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            slot,
            key: key.to_string(),
            locks: Arc::clone(self),
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Table entry + our clone; anything more means another waiter
        let mut slots = self.locks.slots.lock();
        let idle = slots
            .get(&self.key)
            .is_some_and(|s| Arc::ptr_eq(s, &self.slot) && Arc::strong_count(&self.slot) == 2);
        if idle {
            slots.remove(&self.key);
        }
    }
}

/// Applies install/uninstall callbacks to the state store
#[derive(Clone)]
pub struct LifecycleManager {
    store: SharedStore,
    locks: Arc<KeyedLocks>,
}

impl LifecycleManager {
    /// Create a manager over a store
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Validate and upsert an installation.
    ///
    /// Re-installing a known id replaces its record.
    #[instrument(skip(self, payload))]
    pub async fn on_install(&self, payload: InstallPayload) -> Result<Installation> {
        let installation = payload.validate()?;
        let id = installation.id.clone();

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let record = installation.clone();
        let previous = tokio::spawn(async move {
            let _guard = locks.lock(&record.id).await;
            let previous = store.get(&record.id).await?;
            store.put(record).await?;
            Ok::<_, StorageError>(previous)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        info!(
            installation_id = %id,
            group_id = ?installation.group_id,
            room_id = ?installation.room_id,
            reinstall = previous.is_some(),
            "Add-on installed"
        );

        Ok(installation)
    }

    /// Remove an installation.
    ///
    /// Returns whether a record existed; an unknown id is not an error.
    #[instrument(skip(self))]
    pub async fn on_uninstall(&self, id: &str) -> Result<bool> {
        if id.trim().is_empty() {
            return Err(ValidationError::MissingField("id").into());
        }

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let key = id.to_string();
        let removed = tokio::spawn(async move {
            let _guard = locks.lock(&key).await;
            store.delete(&key).await
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        if removed.is_some() {
            info!(installation_id = %id, "Add-on uninstalled");
        } else {
            debug!(installation_id = %id, "Uninstall for unknown installation ignored");
        }

        Ok(removed.is_some())
    }
}
