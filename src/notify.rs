//! Outbound room notifications
//!
//! Sends messages into a chat room on behalf of an installation.
//!
//! ```text
//! send_notification ──▶ access token ──▶ POST {apiBaseUrl}/room/{room}/notification
//!                          │
//!                          ├── oauthTokenUrl set: client-credentials exchange
//!                          └── otherwise: HS256 token signed with the secret
//! ```
//!
//! A fresh token is obtained for every send. Nothing here retries; failures
//! go back to the caller as [`NotifyError`].

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::error::{NotifyError, NotifyResult};
use crate::store::Installation;

/// Lifetime of self-signed outbound tokens
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Per-request timeout for calls to the host platform
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in [`NotifyError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// Message background color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Yellow (host default)
    Yellow,
    /// Green
    Green,
    /// Red
    Red,
    /// Purple
    Purple,
    /// Gray
    Gray,
    /// Host picks one
    Random,
}

/// How the host renders the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Basic HTML
    Html,
    /// Plain text with mentions and emoticons
    Text,
}

/// A room notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Message body
    pub message: String,
    /// Background color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    /// Rendering format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_format: Option<MessageFormat>,
    /// Whether room members get alerted
    #[serde(default)]
    pub notify: bool,
    /// Label shown next to the add-on name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Notification {
    /// Plain message with host defaults
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            color: None,
            message_format: None,
            notify: false,
            from: None,
        }
    }

    /// Set the color
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    /// Set the format
    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.message_format = Some(format);
        self
    }

    /// Alert room members
    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Set the sender label
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct OutboundClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
    scope: String,
}

/// Sends notifications to the host platform
#[derive(Debug, Clone)]
pub struct NotificationClient {
    http: reqwest::Client,
    scopes: Vec<String>,
    token_ttl: Duration,
}

impl NotificationClient {
    /// Create a client requesting `scopes` for each token
    pub fn new<I, S>(scopes: I) -> NotifyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http_client(http, scopes))
    }

    /// Create a client around an existing `reqwest::Client`
    pub fn with_http_client<I, S>(http: reqwest::Client, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            http,
            scopes: scopes.into_iter().map(Into::into).collect(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Override the lifetime of self-signed tokens
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Scopes requested for each token
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Send to the room the add-on was installed in
    pub async fn send_notification(
        &self,
        installation: &Installation,
        notification: &Notification,
    ) -> NotifyResult<()> {
        let room_id = installation.room_id.as_deref().ok_or_else(|| {
            NotifyError::InvalidEndpoint(format!(
                "installation {} has no room; use send_room_notification",
                installation.id
            ))
        })?;
        self.send_room_notification(installation, room_id, notification)
            .await
    }

    /// Send to an explicit room, for group-wide installations
    #[instrument(skip(self, installation, notification), fields(installation_id = %installation.id))]
    pub async fn send_room_notification(
        &self,
        installation: &Installation,
        room_id: &str,
        notification: &Notification,
    ) -> NotifyResult<()> {
        let endpoint = notification_url(&installation.api_base_url, room_id)?;
        let token = self.access_token(installation).await?;

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(token)
            .json(notification)
            .send()
            .await?;
        check_status(response).await?;

        info!(room_id, "Notification sent");
        Ok(())
    }

    /// Obtain a fresh API token for the installation
    pub async fn access_token(&self, installation: &Installation) -> NotifyResult<String> {
        match &installation.oauth_token_url {
            Some(token_url) => self.exchange_token(installation, token_url).await,
            None => self.sign_token(installation),
        }
    }

    async fn exchange_token(
        &self,
        installation: &Installation,
        token_url: &str,
    ) -> NotifyResult<String> {
        let url = parse_endpoint(token_url)?;
        let scope = self.scopes.join(" ");

        let response = self
            .http
            .post(url)
            .basic_auth(&installation.id, Some(&installation.secret))
            .form(&[("grant_type", "client_credentials"), ("scope", scope.as_str())])
            .send()
            .await?;

        let response = check_status(response).await.map_err(|e| match e {
            NotifyError::Status { status, body } => {
                NotifyError::Token(format!("token endpoint returned {status}: {body}"))
            }
            other => other,
        })?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Token(format!("invalid token response: {e}")))?;
        if token.access_token.is_empty() {
            return Err(NotifyError::Token("empty access_token".to_string()));
        }

        debug!(
            installation_id = %installation.id,
            expires_in = ?token.expires_in,
            "Obtained access token"
        );
        Ok(token.access_token)
    }

    fn sign_token(&self, installation: &Installation) -> NotifyResult<String> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = OutboundClaims {
            iss: &installation.id,
            iat: now,
            exp: now.saturating_add(ttl),
            jti: Uuid::new_v4().to_string(),
            scope: self.scopes.join(" "),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(installation.secret.as_bytes()),
        )
        .map_err(|e| NotifyError::Token(e.to_string()))
    }
}

fn parse_endpoint(raw: &str) -> NotifyResult<Url> {
    let url = Url::parse(raw).map_err(|e| NotifyError::InvalidEndpoint(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(NotifyError::InvalidEndpoint(format!(
            "{raw}: not an absolute http(s) URL"
        )));
    }
    Ok(url)
}

/// `{api_base_url}/room/{room_id}/notification`, with the room id escaped
fn notification_url(api_base_url: &str, room_id: &str) -> NotifyResult<Url> {
    if room_id.is_empty() {
        return Err(NotifyError::InvalidEndpoint("empty room id".to_string()));
    }

    let mut url = parse_endpoint(api_base_url)?;
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| NotifyError::InvalidEndpoint(format!("{api_base_url}: cannot be a base")))?
        .pop_if_empty()
        .extend(["room", room_id, "notification"]);
    Ok(url)
}

async fn check_status(response: reqwest::Response) -> NotifyResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    })
}
