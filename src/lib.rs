//! HipChat AddOn - Installable Add-on Runtime for Chat Platforms
//!
//! This crate provides the runtime a third-party service needs to integrate
//! with a chat platform as an installable add-on.
//!
//! # Features
//!
//! - **Capabilities Manifest**: Discovery document built from static configuration
//! - **Installation Lifecycle**: Install/uninstall handshake with durable state
//! - **Webhook Authentication**: HS256 token verification per installation
//! - **Event Routing**: Event name and pattern matching to typed handlers
//! - **Notifications**: Signed outbound room notifications
//!
//! # Architecture
//!
//! ```text
//! Host Platform ──▶ HTTP Server ──▶ Lifecycle Manager ──▶ State Store
//!                       │                                     ▲
//!                       ▼                                     │
//!               Webhook Authenticator ────────────────────────┤
//!                       │                                     │
//!                       ▼                                     │
//!                  Event Router ──▶ WebHookHandler ──▶ Notification Client
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hipchat_addon::config::{AddonConfig, ServerConfig, WebHookSpec};
//! use hipchat_addon::{AddOn, LoggingHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addon = AddonConfig::new("my-addon", "My AddOn")
//!         .with_scope("send_notification")
//!         .with_webhook(WebHookSpec::new("echo", "room_message").with_pattern("^/echo"));
//!     let server = ServerConfig::new("127.0.0.1:3000".parse()?, None, "state")?;
//!
//!     AddOn::builder(addon, server)
//!         .webhook_handler("echo", Arc::new(LoggingHandler))
//!         .build()
//!         .await?
//!         .serve()
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod notify;
pub mod router;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::WebhookAuthenticator;
pub use descriptor::{AuthenticationMode, CapabilitiesDescriptor, WebHookDeclaration};
pub use error::{Error, Result};
pub use lifecycle::{InstallPayload, LifecycleManager};
pub use notify::{Notification, NotificationClient};
pub use router::{DispatchOutcome, EventRouter, InboundEvent, LoggingHandler, WebHookHandler};
pub use server::{AddOn, AddOnBuilder};
pub use store::{FileStateStore, Installation, MemoryStateStore, SharedStore, StateStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
