//! Event routing
//!
//! Matches authenticated webhook deliveries against their declaration and
//! hands them to the application handler registered for the webhook key.
//!
//! # Architecture
//!
//! ```text
//! InboundEvent ──▶ event name check ──▶ pattern check ──▶ WebHookHandler::handle
//!                        │                    │                    │
//!                        ▼                    ▼                    ▼
//!                     Ignored              Ignored       Delivered / CallbackError
//! ```
//!
//! The router performs no retries; the host platform redelivers on a 5xx.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::descriptor::{CapabilitiesDescriptor, WebHookDeclaration};
use crate::error::{CallbackError, ConfigError};
use crate::store::Installation;

/// Event payload delivered by the host platform.
///
/// An open JSON object; the shape depends on the event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboundEvent(pub Map<String, Value>);

impl InboundEvent {
    /// Parse a request body; only JSON objects are events
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// The `event` field, e.g. `room_message`
    pub fn event_name(&self) -> Option<&str> {
        self.0.get("event").and_then(Value::as_str)
    }

    /// The installation id the host stamps on every delivery
    pub fn oauth_client_id(&self) -> Option<&str> {
        self.0.get("oauth_client_id").and_then(Value::as_str)
    }

    /// Text the webhook pattern is matched against.
    ///
    /// Message events carry it at `item.message.message`; a top-level
    /// `message` string is accepted as a fallback.
    pub fn message_text(&self) -> Option<&str> {
        self.0
            .get("item")
            .and_then(|item| item.pointer("/message/message"))
            .and_then(Value::as_str)
            .or_else(|| self.0.get("message").and_then(Value::as_str))
    }

    /// Borrow the raw object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Application code bound to a webhook
#[async_trait::async_trait]
pub trait WebHookHandler: Send + Sync + 'static {
    /// Handle one matched delivery
    async fn handle(
        &self,
        installation: &Installation,
        webhook: &WebHookDeclaration,
        event: &InboundEvent,
    ) -> anyhow::Result<()>;
}

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and succeeded
    Delivered,
    /// The event did not match; handler not called
    Ignored,
}

struct Route {
    pattern: Option<Regex>,
    handler: Arc<dyn WebHookHandler>,
}

/// Table from webhook key to compiled pattern and handler
#[derive(Clone)]
pub struct EventRouter {
    routes: Arc<HashMap<String, Route>>,
}

impl EventRouter {
    /// Bind handlers to the descriptor's webhooks.
    ///
    /// Every declared webhook needs exactly one handler, and every handler
    /// must name a declared webhook.
    pub fn new(
        descriptor: &CapabilitiesDescriptor,
        mut handlers: HashMap<String, Arc<dyn WebHookHandler>>,
    ) -> Result<Self, ConfigError> {
        let mut routes = HashMap::with_capacity(descriptor.webhooks().len());

        for webhook in descriptor.webhooks() {
            let handler = handlers
                .remove(&webhook.key)
                .ok_or_else(|| ConfigError::MissingHandler(webhook.key.clone()))?;

            let pattern = webhook
                .pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| ConfigError::InvalidPattern {
                    webhook: webhook.key.clone(),
                    reason: e.to_string(),
                })?;

            routes.insert(webhook.key.clone(), Route { pattern, handler });
        }

        if let Some(key) = handlers.into_keys().next() {
            return Err(ConfigError::UnknownHandler(key));
        }

        Ok(Self {
            routes: Arc::new(routes),
        })
    }

    /// Whether the event should reach the handler of `webhook`
    pub fn matches(&self, webhook: &WebHookDeclaration, event: &InboundEvent) -> bool {
        if let Some(name) = event.event_name() {
            if name != webhook.event {
                return false;
            }
        }

        match self.routes.get(&webhook.key).and_then(|r| r.pattern.as_ref()) {
            Some(pattern) => event.message_text().is_some_and(|text| pattern.is_match(text)),
            None => true,
        }
    }

    /// Route one authenticated delivery.
    ///
    /// A non-matching event is ignored without error. The handler runs to
    /// completion before this returns; its error is wrapped, not retried.
    #[instrument(skip_all, fields(webhook = %webhook.key, installation_id = %installation.id))]
    pub async fn dispatch(
        &self,
        webhook: &WebHookDeclaration,
        installation: &Installation,
        event: &InboundEvent,
    ) -> Result<DispatchOutcome, CallbackError> {
        let route = self
            .routes
            .get(&webhook.key)
            .ok_or_else(|| CallbackError::NoHandler(webhook.key.clone()))?;

        if !self.matches(webhook, event) {
            debug!(event = ?event.event_name(), "Event did not match webhook; ignoring");
            return Ok(DispatchOutcome::Ignored);
        }

        route
            .handler
            .handle(installation, webhook, event)
            .await
            .map_err(|source| CallbackError::Handler {
                webhook: webhook.key.clone(),
                source,
            })?;

        Ok(DispatchOutcome::Delivered)
    }
}

/// Handler that only logs deliveries
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

#[async_trait::async_trait]
impl WebHookHandler for LoggingHandler {
    async fn handle(
        &self,
        installation: &Installation,
        webhook: &WebHookDeclaration,
        event: &InboundEvent,
    ) -> anyhow::Result<()> {
        info!(
            installation_id = %installation.id,
            webhook = %webhook.key,
            event = ?event.event_name(),
            message = ?event.message_text(),
            "Webhook delivered"
        );
        Ok(())
    }
}
