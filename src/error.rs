//! Error types for the add-on runtime
//!
//! This module provides the error hierarchy using `thiserror`. Each component
//! owns one enum; [`Error`] unifies them and decides how a failure is
//! reported to the host platform over HTTP.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Response body used for every authentication failure.
///
/// The reason is never sent back so callers cannot learn which
/// installation ids exist.
pub const UNAUTHORIZED_BODY: &str = "unauthorized";

/// The main error type for add-on runtime operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed install/uninstall payload
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Webhook token rejected
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// State store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Outbound notification failure
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// Application callback failure
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    /// Invalid static configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Install/uninstall payload problems
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent or empty
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A URL field is not an absolute http(s) URL
    #[error("invalid URL in field {field}: {reason}")]
    InvalidUrl {
        /// Payload field name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The body could not be decoded at all
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Webhook authentication failures
///
/// Variants are kept distinct for logging only; the HTTP response is the
/// same for all of them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token in header or query string
    #[error("missing token")]
    MissingToken,

    /// Token could not be decoded
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The `iss` claim names no known installation
    #[error("unknown installation")]
    UnknownInstallation,

    /// Signature does not verify with the installation secret
    #[error("signature mismatch")]
    InvalidSignature,

    /// `exp` is in the past
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future
    #[error("token not yet valid")]
    NotYetValid,

    /// Issuer/audience or other claim checks failed
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
}

/// State store failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the backing medium failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path of the state file
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Persisted state exists but cannot be trusted
    #[error("corrupt state in {path}: {reason}")]
    Corrupt {
        /// Path of the state file
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Encoding the state document failed
    #[error("failed to serialize state: {0}")]
    Serialize(String),

    /// A background write task died before finishing
    #[error("write task failed: {0}")]
    Task(String),
}

/// Outbound notification failures
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The installation's endpoints cannot be used to build a request
    #[error("invalid installation endpoint: {0}")]
    InvalidEndpoint(String),

    /// Obtaining an access token failed
    #[error("token request failed: {0}")]
    Token(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The host platform answered with a non-success status
    #[error("HTTP error {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
}

/// Application callback failures surfaced by the event router
#[derive(Error, Debug)]
pub enum CallbackError {
    /// The bound handler returned an error
    #[error("handler for webhook {webhook} failed: {source}")]
    Handler {
        /// Webhook key
        webhook: String,
        /// Error returned by application code
        #[source]
        source: anyhow::Error,
    },

    /// No handler is registered for the webhook key
    #[error("no handler registered for webhook {0}")]
    NoHandler(String),
}

/// Static configuration problems, detected before serving
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Base URL unusable for building absolute links
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Webhook pattern is not a valid regular expression
    #[error("invalid pattern for webhook {webhook}: {reason}")]
    InvalidPattern {
        /// Webhook key
        webhook: String,
        /// Regex compile error
        reason: String,
    },

    /// Two webhooks share a key
    #[error("duplicate webhook key: {0}")]
    DuplicateWebhook(String),

    /// Webhook path is not absolute or collides with another route
    #[error("invalid path for webhook {webhook}: {reason}")]
    InvalidPath {
        /// Webhook key
        webhook: String,
        /// Why the path was rejected
        reason: String,
    },

    /// A declared webhook has no handler
    #[error("webhook {0} has no handler")]
    MissingHandler(String),

    /// A handler was registered for an undeclared webhook
    #[error("handler registered for undeclared webhook {0}")]
    UnknownHandler(String),
}

/// Result type alias for add-on runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias for state store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result alias for notification sends
pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

/// Result alias for webhook authentication
pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }

    /// HTTP status reported to the host platform for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Notify(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_)
            | Error::Callback(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to put in a response body
    pub fn public_message(&self) -> String {
        match self {
            Error::Auth(_) => UNAUTHORIZED_BODY.to_string(),
            Error::Validation(e) => e.to_string(),
            Error::Json(e) => format!("malformed payload: {e}"),
            Error::Storage(_) => "failed to persist installation".to_string(),
            Error::Callback(_) => "webhook handler failed".to_string(),
            Error::Notify(_) => "notification failed".to_string(),
            Error::Config(_) | Error::Io(_) | Error::Generic(_) => {
                "internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}
