//! Process configuration
//!
//! Everything the runtime needs before serving is carried in explicit values
//! handed to [`crate::AddOn::builder`]; nothing is read from globals.

use std::net::SocketAddr;
use std::path::PathBuf;

use url::Url;

use crate::descriptor::{AuthenticationMode, Vendor};
use crate::error::ConfigError;

/// Where to listen, how the host platform reaches us, where state lives.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind
    pub listen: SocketAddr,
    /// Public base URL, without trailing slash
    pub base_url: Url,
    /// Path of the durable state file
    pub state_file: PathBuf,
}

impl ServerConfig {
    /// Build a config, defaulting the base URL to `http://{listen}`.
    pub fn new(
        listen: SocketAddr,
        base_url: Option<&str>,
        state_file: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let raw = match base_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => format!("http://{listen}"),
        };

        Ok(Self {
            listen,
            base_url: parse_base_url(&raw)?,
            state_file: state_file.into(),
        })
    }

    /// Absolute URL for a resource path such as `/install`.
    pub fn url(&self, resource: &str) -> String {
        join_url(&self.base_url, resource)
    }
}

/// Parse and normalise a public base URL.
pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBaseUrl(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidBaseUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(format!("{raw}: missing host")));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::InvalidBaseUrl(format!(
            "{raw}: query and fragment are not allowed"
        )));
    }

    Ok(url)
}

/// Concatenate base URL and resource path, tolerating slashes on either side.
pub(crate) fn join_url(base: &Url, resource: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    let resource = resource.trim_start_matches('/');
    format!("{base}/{resource}")
}

/// Static description of the add-on, input to the manifest builder.
#[derive(Debug, Clone)]
pub struct AddonConfig {
    /// Display name
    pub name: String,
    /// One-line description
    pub description: String,
    /// Globally unique add-on key
    pub key: String,
    /// Who publishes the add-on
    pub vendor: Option<Vendor>,
    /// Human-facing homepage
    pub homepage: Option<String>,
    /// API scopes requested from the host platform
    pub scopes: Vec<String>,
    /// Installable at group level
    pub allow_global: bool,
    /// Installable in a single room
    pub allow_room: bool,
    /// Declared webhooks, in manifest order
    pub webhooks: Vec<WebHookSpec>,
}

impl AddonConfig {
    /// Minimal room-installable add-on with no scopes and no webhooks.
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            key: key.into(),
            vendor: None,
            homepage: None,
            scopes: Vec::new(),
            allow_global: false,
            allow_room: true,
            webhooks: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the vendor
    pub fn with_vendor(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.vendor = Some(Vendor {
            name: name.into(),
            url: url.into(),
        });
        self
    }

    /// Set the homepage link
    pub fn with_homepage(mut self, homepage: impl Into<String>) -> Self {
        self.homepage = Some(homepage.into());
        self
    }

    /// Request an API scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Choose where the add-on may be installed
    pub fn installable(mut self, allow_global: bool, allow_room: bool) -> Self {
        self.allow_global = allow_global;
        self.allow_room = allow_room;
        self
    }

    /// Declare a webhook
    pub fn with_webhook(mut self, webhook: WebHookSpec) -> Self {
        self.webhooks.push(webhook);
        self
    }
}

/// Static declaration of one webhook subscription.
#[derive(Debug, Clone)]
pub struct WebHookSpec {
    /// Identifier binding the webhook to its handler
    pub key: String,
    /// Display name
    pub name: String,
    /// Host platform event, e.g. `room_message`
    pub event: String,
    /// Optional regex the message text must match
    pub pattern: Option<String>,
    /// How deliveries are authenticated
    pub authentication: AuthenticationMode,
    /// Path under the base URL where deliveries arrive
    pub path: String,
}

impl WebHookSpec {
    /// JWT-authenticated webhook at `/webhook/{key}`.
    pub fn new(key: impl Into<String>, event: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            path: format!("/webhook/{key}"),
            key,
            event: event.into(),
            pattern: None,
            authentication: AuthenticationMode::Jwt,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Only deliver messages matching `pattern`
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Set the authentication mode
    pub fn with_authentication(mut self, mode: AuthenticationMode) -> Self {
        self.authentication = mode;
        self
    }

    /// Override the delivery path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}
