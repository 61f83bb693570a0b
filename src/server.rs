//! HTTP server and add-on runtime
//!
//! [`AddOn`] binds the manifest, lifecycle manager, authenticator and event
//! router into one axum [`Router`] and owns the listen/accept loop.
//!
//! # Routes
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET | `/capabilities.json` | serialized descriptor |
//! | POST | `/install` | install callback |
//! | DELETE | `/install/:id` | uninstall callback |
//! | POST | webhook path | one route per declared webhook |
//! | GET | `/health` | liveness |
//! | GET | `/status` | runtime counters |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hipchat_addon::config::{AddonConfig, ServerConfig, WebHookSpec};
//! use hipchat_addon::{AddOn, LoggingHandler};
//!
//! # async fn run() -> hipchat_addon::Result<()> {
//! let addon = AddonConfig::new("my-addon", "My AddOn")
//!     .with_webhook(WebHookSpec::new("hello", "room_message").with_pattern("^/hello"));
//! let server = ServerConfig::new("127.0.0.1:3000".parse().unwrap(), None, "state")?;
//!
//! AddOn::builder(addon, server)
//!     .webhook_handler("hello", Arc::new(LoggingHandler))
//!     .build()
//!     .await?
//!     .serve()
//!     .await
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::WebhookAuthenticator;
use crate::config::{AddonConfig, ServerConfig};
use crate::descriptor::{CapabilitiesDescriptor, CAPABILITIES_PATH, INSTALL_PATH};
use crate::error::{CallbackError, Error, Result, ValidationError};
use crate::handlers::status::{health_handler, RuntimeStats, StatusResponse};
use crate::lifecycle::{InstallPayload, LifecycleManager};
use crate::notify::{Notification, NotificationClient};
use crate::router::{DispatchOutcome, EventRouter, InboundEvent, WebHookHandler};
use crate::store::{FileStateStore, Installation, SharedStore};

/// State shared by every request handler
struct AddOnState {
    descriptor: CapabilitiesDescriptor,
    manifest: Bytes,
    /// Local route path and webhook key, in declaration order
    webhook_routes: Vec<(String, String)>,
    notifier: NotificationClient,
    lifecycle: LifecycleManager,
    authenticator: WebhookAuthenticator,
    router: EventRouter,
    stats: RuntimeStats,
}

type SharedState = Arc<AddOnState>;

/// Builder for [`AddOn`]
pub struct AddOnBuilder {
    addon: AddonConfig,
    server: ServerConfig,
    handlers: HashMap<String, Arc<dyn WebHookHandler>>,
    store: Option<SharedStore>,
    audience: Option<String>,
    notifier: Option<NotificationClient>,
}

impl AddOnBuilder {
    /// Notification client scoped to the add-on's declared scopes.
    ///
    /// Handlers that send notifications take a clone of this client; the
    /// built [`AddOn`] shares the same one.
    pub fn notifier(&mut self) -> Result<NotificationClient> {
        if let Some(notifier) = &self.notifier {
            return Ok(notifier.clone());
        }
        let notifier = NotificationClient::new(self.addon.scopes.iter().cloned())?;
        self.notifier = Some(notifier.clone());
        Ok(notifier)
    }

    /// Bind a handler to the webhook with this key
    pub fn webhook_handler(
        mut self,
        key: impl Into<String>,
        handler: Arc<dyn WebHookHandler>,
    ) -> Self {
        let key = key.into();
        if self.handlers.insert(key.clone(), handler).is_some() {
            warn!(webhook = %key, "Replacing previously registered webhook handler");
        }
        self
    }

    /// Use this store instead of opening the configured state file
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Require webhook tokens to carry this audience
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Validate configuration and open the state store.
    ///
    /// Fails on invalid configuration, unbound webhooks, or a state file
    /// that cannot be loaded.
    pub async fn build(mut self) -> Result<AddOn> {
        let descriptor = CapabilitiesDescriptor::build(&self.addon, &self.server.base_url)?;
        let notifier = self.notifier()?;
        let router = EventRouter::new(&descriptor, self.handlers)?;
        let manifest = Bytes::from(serde_json::to_vec(&descriptor)?);
        let webhook_routes = self
            .addon
            .webhooks
            .iter()
            .map(|spec| (spec.path.clone(), spec.key.clone()))
            .collect();

        let store: SharedStore = match self.store {
            Some(store) => store,
            None => Arc::new(FileStateStore::open(&self.server.state_file).await?),
        };

        let mut authenticator = WebhookAuthenticator::new(Arc::clone(&store));
        if let Some(audience) = self.audience {
            authenticator = authenticator.with_audience(audience);
        }

        info!(
            key = %descriptor.key,
            base_url = %self.server.base_url,
            webhooks = descriptor.webhooks().len(),
            "Add-on runtime initialized"
        );

        Ok(AddOn {
            config: self.server,
            state: Arc::new(AddOnState {
                descriptor,
                manifest,
                webhook_routes,
                notifier,
                lifecycle: LifecycleManager::new(store),
                authenticator,
                router,
                stats: RuntimeStats::new(),
            }),
        })
    }
}

/// A configured add-on, ready to serve
#[derive(Clone)]
pub struct AddOn {
    config: ServerConfig,
    state: SharedState,
}

impl AddOn {
    /// Start building an add-on
    pub fn builder(addon: AddonConfig, server: ServerConfig) -> AddOnBuilder {
        AddOnBuilder {
            addon,
            server,
            handlers: HashMap::new(),
            store: None,
            audience: None,
            notifier: None,
        }
    }

    /// The capabilities descriptor
    pub fn descriptor(&self) -> &CapabilitiesDescriptor {
        &self.state.descriptor
    }

    /// The lifecycle manager
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.state.lifecycle
    }

    /// The installation store
    pub fn store(&self) -> &SharedStore {
        self.state.lifecycle.store()
    }

    /// The webhook authenticator
    pub fn authenticator(&self) -> &WebhookAuthenticator {
        &self.state.authenticator
    }

    /// Notification client scoped to the declared API scopes
    pub fn notifier(&self) -> &NotificationClient {
        &self.state.notifier
    }

    /// Send a notification to the installation's room
    pub async fn send_notification(
        &self,
        installation: &Installation,
        notification: &Notification,
    ) -> Result<()> {
        Ok(self
            .state
            .notifier
            .send_notification(installation, notification)
            .await?)
    }

    /// Runtime counters
    pub fn stats(&self) -> &RuntimeStats {
        &self.state.stats
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum router for all add-on endpoints
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route(CAPABILITIES_PATH, get(capabilities))
            .route(INSTALL_PATH, post(install))
            .route(&format!("{INSTALL_PATH}/:id"), delete(uninstall))
            .route("/health", get(health_handler))
            .route("/status", get(status));

        for (path, key) in &self.state.webhook_routes {
            let key = key.clone();
            router = router.route(
                path,
                post(
                    move |State(state): State<SharedState>,
                          headers: HeaderMap,
                          RawQuery(query): RawQuery,
                          body: Bytes| async move {
                        deliver(state, &key, headers, query, body).await
                    },
                ),
            );
        }

        router
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already bound listener until Ctrl-C
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, base_url = %self.config.base_url, "Add-on server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Add-on server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn capabilities(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.manifest.clone(),
    )
}

async fn install(State(state): State<SharedState>, body: Bytes) -> Result<StatusCode> {
    let payload = InstallPayload::from_slice(&body).inspect_err(|e| {
        warn!(error = %e, "Rejected install callback");
    })?;

    match state.lifecycle.on_install(payload).await {
        Ok(_) => {
            state.stats.record_install();
            Ok(StatusCode::OK)
        }
        Err(e) => {
            match &e {
                Error::Validation(reason) => warn!(%reason, "Rejected install callback"),
                other => error!(error = %other, "Install callback failed"),
            }
            Err(e)
        }
    }
}

async fn uninstall(State(state): State<SharedState>, Path(id): Path<String>) -> Result<StatusCode> {
    let removed = state.lifecycle.on_uninstall(&id).await.inspect_err(|e| {
        error!(installation_id = %id, error = %e, "Uninstall callback failed");
    })?;

    if removed {
        state.stats.record_uninstall();
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(state): State<SharedState>) -> Result<Json<StatusResponse>> {
    let installations = state.lifecycle.store().list().await?.len();
    Ok(Json(StatusResponse::collect(&state.stats, installations)))
}

/// Authenticate, parse and route one webhook delivery
#[instrument(skip_all, fields(webhook = %key))]
async fn deliver(
    state: SharedState,
    key: &str,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Result<StatusCode> {
    state.stats.record_webhook_received();

    let webhook = state
        .descriptor
        .webhook(key)
        .ok_or_else(|| CallbackError::NoHandler(key.to_string()))?;

    // Authenticate before looking at the body
    let verified = if webhook.requires_token() {
        match state
            .authenticator
            .authenticate(&headers, query.as_deref())
            .await
        {
            Ok(installation) => Some(installation),
            Err(Error::Auth(reason)) => {
                state.stats.record_auth_failure();
                warn!("Rejected webhook delivery");
                return Err(reason.into());
            }
            Err(e) => {
                error!(error = %e, "Webhook authentication could not complete");
                return Err(e);
            }
        }
    } else {
        None
    };

    let event = InboundEvent::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Malformed webhook payload");
        ValidationError::MalformedPayload(e.to_string())
    })?;

    let installation = match verified {
        Some(installation) => installation,
        None => match state
            .authenticator
            .installation_for_event(&event)
            .await?
        {
            Some(installation) => installation,
            None => {
                debug!(
                    oauth_client_id = ?event.oauth_client_id(),
                    "No installation for unauthenticated delivery; acknowledging"
                );
                state.stats.record_ignored();
                return Ok(StatusCode::OK);
            }
        },
    };

    let started = Instant::now();
    match state.router.dispatch(webhook, &installation, &event).await {
        Ok(DispatchOutcome::Delivered) => {
            state.stats.record_delivered(started.elapsed());
            debug!(installation_id = %installation.id, "Webhook delivered");
            Ok(StatusCode::OK)
        }
        Ok(DispatchOutcome::Ignored) => {
            state.stats.record_ignored();
            Ok(StatusCode::OK)
        }
        Err(e) => {
            state.stats.record_callback_error(started.elapsed());
            error!(installation_id = %installation.id, error = ?e, "Webhook handler failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebHookSpec;
    use crate::router::LoggingHandler;
    use crate::store::MemoryStateStore;

    fn configs() -> (AddonConfig, ServerConfig) {
        let addon = AddonConfig::new("test-addon", "Test")
            .with_scope("send_notification")
            .with_scope("view_group")
            .with_webhook(WebHookSpec::new("echo", "room_message"));
        let server = ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            Some("https://addon.example.com"),
            "unused",
        )
        .unwrap();
        (addon, server)
    }

    #[tokio::test]
    async fn test_build_requires_handlers() {
        let (addon, server) = configs();
        let result = AddOn::builder(addon, server)
            .store(Arc::new(MemoryStateStore::new()))
            .build()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_build_serializes_manifest_once() {
        let (addon, server) = configs();
        let addon = AddOn::builder(addon, server)
            .webhook_handler("echo", Arc::new(LoggingHandler))
            .store(Arc::new(MemoryStateStore::new()))
            .build()
            .await
            .unwrap();

        let parsed: CapabilitiesDescriptor =
            serde_json::from_slice(&addon.state.manifest).unwrap();
        assert_eq!(&parsed, addon.descriptor());
        assert_eq!(
            parsed.webhooks()[0].url,
            "https://addon.example.com/webhook/echo"
        );
        assert_eq!(
            addon.state.webhook_routes,
            vec![("/webhook/echo".to_string(), "echo".to_string())]
        );
    }

    #[tokio::test]
    async fn test_notifier_uses_declared_scopes() {
        let (addon, server) = configs();
        let mut builder = AddOn::builder(addon, server);
        let early = builder.notifier().unwrap();

        let addon = builder
            .webhook_handler("echo", Arc::new(LoggingHandler))
            .store(Arc::new(MemoryStateStore::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(addon.notifier().scopes(), addon.descriptor().scopes());
        assert_eq!(early.scopes(), addon.notifier().scopes());
        assert_eq!(
            addon.notifier().scopes(),
            ["send_notification".to_string(), "view_group".to_string()]
        );
    }

    #[tokio::test]
    async fn test_build_fails_on_corrupt_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"{not json").unwrap();

        let (addon, _) = configs();
        let server = ServerConfig::new("127.0.0.1:0".parse().unwrap(), None, &path).unwrap();
        let result = AddOn::builder(addon, server)
            .webhook_handler("echo", Arc::new(LoggingHandler))
            .build()
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}
