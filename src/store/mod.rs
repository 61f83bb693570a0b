//! Installation state store
//!
//! Durable key-value persistence of [`Installation`] records keyed by id.
//! The lifecycle manager only talks to the [`StateStore`] trait, so the same
//! logic runs against a file ([`FileStateStore`]), memory
//! ([`MemoryStateStore`]) or any other backend.
//!
//! # Contract
//!
//! - `put` and `delete` return only after the mutation is durable.
//! - At most one record per id; `put` is an upsert.
//! - Reads may run in parallel; writes to the same id are serialized.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StorageResult;

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

/// Shared handle to a state store backend
pub type SharedStore = Arc<dyn StateStore>;

/// Credentials and endpoints for one tenant's use of the add-on.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    /// Host-assigned installation id (the OAuth client id)
    pub id: String,
    /// Shared secret; verifies inbound tokens and signs outbound ones
    pub secret: String,
    /// Base URL of the host platform REST API
    pub api_base_url: String,
    /// OAuth token endpoint, when the host supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_url: Option<String>,
    /// Group the add-on was installed in
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_number"
    )]
    pub group_id: Option<String>,
    /// Room the add-on was installed in; absent for group-wide installs
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "string_or_number"
    )]
    pub room_id: Option<String>,
    /// Host platform capabilities document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities_url: Option<String>,
    /// When the record was last written by an install callback
    pub installed_at: DateTime<Utc>,
}

impl fmt::Debug for Installation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installation")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("oauth_token_url", &self.oauth_token_url)
            .field("group_id", &self.group_id)
            .field("room_id", &self.room_id)
            .field("capabilities_url", &self.capabilities_url)
            .field("installed_at", &self.installed_at)
            .finish()
    }
}

/// Accept ids the host sends either as JSON numbers or strings.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Durable installation storage
#[async_trait::async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Fetch an installation by id
    async fn get(&self, id: &str) -> StorageResult<Option<Installation>>;

    /// Insert or replace an installation; durable on return
    async fn put(&self, installation: Installation) -> StorageResult<()>;

    /// Remove an installation, returning the removed record if it existed
    async fn delete(&self, id: &str) -> StorageResult<Option<Installation>>;

    /// All installations, in id order
    async fn list(&self) -> StorageResult<Vec<Installation>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn installation(id: &str, secret: &str) -> Installation {
        Installation {
            id: id.to_string(),
            secret: secret.to_string(),
            api_base_url: "https://api.example.com/v2/".to_string(),
            oauth_token_url: Some("https://api.example.com/v2/oauth/token".to_string()),
            group_id: Some("42".to_string()),
            room_id: Some("7".to_string()),
            capabilities_url: None,
            installed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let inst = test_support::installation("abc", "super-secret-value");
        let debug = format!("{inst:?}");
        assert!(debug.contains("abc"));
        assert!(!debug.contains("super-secret-value"));
    }

    #[test]
    fn test_numeric_ids_deserialize_as_strings() {
        let json = serde_json::json!({
            "id": "abc",
            "secret": "s",
            "apiBaseUrl": "https://api.example.com/",
            "groupId": 42,
            "roomId": "7",
            "installedAt": "2024-01-01T00:00:00Z"
        });
        let inst: Installation = serde_json::from_value(json).unwrap();
        assert_eq!(inst.group_id.as_deref(), Some("42"));
        assert_eq!(inst.room_id.as_deref(), Some("7"));
        assert!(inst.oauth_token_url.is_none());
    }
}
