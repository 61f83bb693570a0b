//! Webhook authentication
//!
//! Deliveries for `jwt` webhooks carry an HS256 token signed with the shared
//! secret of the installation named in its `iss` claim.
//!
//! # Flow
//!
//! ```text
//! Request -> extract token -> decode claims (untrusted) -> look up iss
//!                 |                   |                        |
//!                 v                   v                        v
//!            MissingToken      MalformedToken         UnknownInstallation
//!
//!         -> verify signature with installation secret -> check exp/nbf/iss/aud
//!                             |                                  |
//!                             v                                  v
//!                      InvalidSignature                 Expired / NotYetValid
//! ```
//!
//! Every failure maps to the same 401 response; the variant is only logged.

use std::time::Duration;

use http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult, Error, Result, StorageResult};
use crate::router::InboundEvent;
use crate::store::{Installation, SharedStore};

/// Query parameter carrying the token when no header is sent
pub const SIGNED_REQUEST_PARAM: &str = "signed_request";

/// Clock skew tolerated on `exp` and `nbf`
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

/// Claims carried by webhook tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookClaims {
    /// Installation id
    pub iss: String,
    /// Acting user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Not before (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Issued at (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Audience, string or array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Host-specific context (room, user timezone, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Pull the token out of a request.
///
/// Looks at `Authorization: JWT <token>`, then `Authorization: Bearer
/// <token>`, then the `signed_request` query parameter.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("JWT ").or_else(|| h.strip_prefix("Bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == SIGNED_REQUEST_PARAM)
            .map(|(_, v)| v.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

/// Verifies webhook tokens against stored installation secrets
#[derive(Clone)]
pub struct WebhookAuthenticator {
    store: SharedStore,
    audience: Option<String>,
    leeway: Duration,
}

impl WebhookAuthenticator {
    /// Create an authenticator over the installation store
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            audience: None,
            leeway: DEFAULT_LEEWAY,
        }
    }

    /// Require tokens to carry this audience
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Override the clock skew allowance
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Authenticate a request from its headers and raw query string
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<Installation> {
        let token = extract_token(headers, query).ok_or(AuthError::MissingToken)?;
        self.authenticate_token(&token).await
    }

    /// Authenticate a raw token.
    ///
    /// Token problems are [`Error::Auth`]; a store that cannot be read is
    /// [`Error::Storage`], so the host retries instead of giving up.
    pub async fn authenticate_token(&self, token: &str) -> Result<Installation> {
        let result = self.verify(token).await;
        match &result {
            Err(Error::Auth(reason)) => debug!(%reason, "Webhook token rejected"),
            Err(e) => warn!(error = %e, "Installation lookup failed during authentication"),
            Ok(_) => {}
        }
        result
    }

    async fn verify(&self, token: &str) -> Result<Installation> {
        let claimed = unverified_claims(token)?;
        if claimed.iss.trim().is_empty() {
            return Err(AuthError::MalformedToken("empty iss claim".to_string()).into());
        }

        let installation = self
            .store
            .get(&claimed.iss)
            .await?
            .ok_or(AuthError::UnknownInstallation)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[&installation.id]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        decode::<WebhookClaims>(
            token,
            &DecodingKey::from_secret(installation.secret.as_bytes()),
            &validation,
        )
        .map_err(map_token_error)?;

        Ok(installation)
    }

    /// Installation for a `none`-authenticated delivery.
    ///
    /// Taken from the event's `oauth_client_id`; `None` when the field is
    /// absent or names no installation.
    pub async fn installation_for_event(
        &self,
        event: &InboundEvent,
    ) -> StorageResult<Option<Installation>> {
        let Some(id) = event.oauth_client_id().filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        self.store.get(id).await
    }
}

/// Decode claims without checking the signature or time bounds
fn unverified_claims(token: &str) -> AuthResult<WebhookClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<WebhookClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::MalformedToken(e.to_string()))
}

fn map_token_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::NotYetValid,
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
            AuthError::InvalidClaims(err.to_string())
        }
        ErrorKind::MissingRequiredClaim(claim) => {
            AuthError::InvalidClaims(format!("missing {claim}"))
        }
        _ => AuthError::MalformedToken(err.to_string()),
    }
}
