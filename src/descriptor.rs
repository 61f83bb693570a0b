//! Capabilities Descriptor
//!
//! The discovery document served at `/capabilities.json`. It is built once
//! from [`AddonConfig`] and the public base URL, never mutated afterwards and
//! never depends on installation state, so the same inputs always produce the
//! same bytes.
//!
//! # Shape
//!
//! ```text
//! CapabilitiesDescriptor
//!   ├── name / description / key
//!   ├── vendor { name, url }
//!   ├── links { homepage, self }
//!   └── capabilities
//!         ├── hipchatApiConsumer { scopes }
//!         ├── installable { allowGlobal, allowRoom, callbackUrl }
//!         └── webhook [ { key, name, event, pattern, authentication, url } ]
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{join_url, AddonConfig};
use crate::error::ConfigError;

/// Path of the discovery endpoint
pub const CAPABILITIES_PATH: &str = "/capabilities.json";

/// Path of the install callback; uninstall is `DELETE {INSTALL_PATH}/{id}`
pub const INSTALL_PATH: &str = "/install";

/// Paths owned by the runtime itself
const RESERVED_PATHS: [&str; 4] = [CAPABILITIES_PATH, INSTALL_PATH, "/health", "/status"];

/// How a webhook delivery proves where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMode {
    /// No token; installation taken from the payload
    None,
    /// HS256 token signed with the installation secret
    #[default]
    Jwt,
}

impl AuthenticationMode {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Jwt => "jwt",
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add-on publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    /// Vendor name
    pub name: String,
    /// Vendor URL
    pub url: String,
}

/// Links block of the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    /// Human-facing homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Absolute URL of this descriptor
    #[serde(rename = "self")]
    pub self_url: String,
}

/// API access requested from the host platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConsumer {
    /// Requested scopes
    pub scopes: Vec<String>,
}

/// Where and how the add-on can be installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installable {
    /// Installable for a whole group
    pub allow_global: bool,
    /// Installable in a single room
    pub allow_room: bool,
    /// Absolute URL of the install callback
    pub callback_url: String,
}

/// One webhook subscription as advertised to the host platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebHookDeclaration {
    /// Identifier binding the webhook to its handler
    pub key: String,
    /// Display name
    pub name: String,
    /// Event subscribed to
    pub event: String,
    /// Regex the message text must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Required authentication
    #[serde(default)]
    pub authentication: AuthenticationMode,
    /// Absolute URL the host platform posts deliveries to
    pub url: String,
}

impl WebHookDeclaration {
    /// Whether deliveries must carry a signed token
    pub fn requires_token(&self) -> bool {
        self.authentication == AuthenticationMode::Jwt
    }
}

/// Capabilities block of the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// API scopes
    pub hipchat_api_consumer: ApiConsumer,
    /// Install callback
    pub installable: Installable,
    /// Declared webhooks, in configuration order
    #[serde(default, rename = "webhook")]
    pub webhooks: Vec<WebHookDeclaration>,
}

/// The full discovery document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesDescriptor {
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Globally unique add-on key
    pub key: String,
    /// Publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<Vendor>,
    /// Links
    pub links: Links,
    /// Capabilities
    pub capabilities: Capabilities,
}

impl CapabilitiesDescriptor {
    /// Build the descriptor from static configuration.
    ///
    /// Pure: performs no I/O. Every URL in the result is absolute and derived
    /// from `base_url`.
    pub fn build(config: &AddonConfig, base_url: &Url) -> Result<Self, ConfigError> {
        let mut keys = HashSet::new();
        let mut paths: HashSet<&str> = HashSet::new();
        let mut webhooks = Vec::with_capacity(config.webhooks.len());

        for spec in &config.webhooks {
            if !keys.insert(spec.key.as_str()) {
                return Err(ConfigError::DuplicateWebhook(spec.key.clone()));
            }

            validate_path(&spec.key, &spec.path)?;
            if !paths.insert(spec.path.as_str()) {
                return Err(ConfigError::InvalidPath {
                    webhook: spec.key.clone(),
                    reason: format!("{} is already used by another webhook", spec.path),
                });
            }

            if let Some(pattern) = &spec.pattern {
                regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    webhook: spec.key.clone(),
                    reason: e.to_string(),
                })?;
            }

            webhooks.push(WebHookDeclaration {
                key: spec.key.clone(),
                name: spec.name.clone(),
                event: spec.event.clone(),
                pattern: spec.pattern.clone(),
                authentication: spec.authentication,
                url: join_url(base_url, &spec.path),
            });
        }

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            key: config.key.clone(),
            vendor: config.vendor.clone(),
            links: Links {
                homepage: config.homepage.clone(),
                self_url: join_url(base_url, CAPABILITIES_PATH),
            },
            capabilities: Capabilities {
                hipchat_api_consumer: ApiConsumer {
                    scopes: config.scopes.clone(),
                },
                installable: Installable {
                    allow_global: config.allow_global,
                    allow_room: config.allow_room,
                    callback_url: join_url(base_url, INSTALL_PATH),
                },
                webhooks,
            },
        })
    }

    /// Declared webhooks, in manifest order
    pub fn webhooks(&self) -> &[WebHookDeclaration] {
        &self.capabilities.webhooks
    }

    /// Look up a webhook by key
    pub fn webhook(&self, key: &str) -> Option<&WebHookDeclaration> {
        self.webhooks().iter().find(|w| w.key == key)
    }

    /// Requested API scopes
    pub fn scopes(&self) -> &[String] {
        &self.capabilities.hipchat_api_consumer.scopes
    }
}

fn validate_path(webhook: &str, path: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPath {
        webhook: webhook.to_string(),
        reason: format!("{path}: {reason}"),
    };

    if !path.starts_with('/') || path.len() < 2 {
        return Err(invalid("must be an absolute path below the base URL"));
    }
    if path.contains([':', '*', '?', '#', '{', '}']) {
        return Err(invalid("must not contain route parameters, query or fragment"));
    }
    if RESERVED_PATHS.contains(&path) || path.starts_with("/install/") {
        return Err(invalid("collides with a built-in route"));
    }
    Ok(())
}
