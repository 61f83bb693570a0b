//! Echo HipChat AddOn
//!
//! Example add-on that sends every matched room message back to the room as
//! a JSON dump of the event.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hipchat_addon::config::{AddonConfig, ServerConfig, WebHookSpec};
use hipchat_addon::{
    AddOn, AuthenticationMode, InboundEvent, Installation, Notification, NotificationClient,
    WebHookDeclaration, WebHookHandler,
};

const HOMEPAGE: &str = "https://github.com/davidrjonas/hipchat-addon";

/// Echo HipChat AddOn
#[derive(Parser, Debug)]
#[command(name = "echo-addon")]
#[command(version)]
#[command(about = "Example HipChat add-on that echoes room messages")]
struct Args {
    /// The IP address on which to listen
    #[arg(short = 'H', long, env = "ADDON_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// The port on which to listen
    #[arg(short, long, env = "ADDON_PORT", default_value = "3000")]
    port: u16,

    /// The base URL, defaults to the host and port
    #[arg(short, long, env = "ADDON_URL")]
    url: Option<String>,

    /// The file to read/store state information
    #[arg(long, env = "ADDON_STATE_FILE", default_value = "state")]
    state_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, env = "ADDON_VERBOSE")]
    verbose: bool,
}

/// Dumps the event as JSON into the room it came from
struct EchoHandler {
    notifier: NotificationClient,
}

#[async_trait::async_trait]
impl WebHookHandler for EchoHandler {
    async fn handle(
        &self,
        installation: &Installation,
        _webhook: &WebHookDeclaration,
        event: &InboundEvent,
    ) -> anyhow::Result<()> {
        tracing::info!(installation_id = %installation.id, "Received webhook callback");

        let message = serde_json::to_string(event).unwrap_or_else(|e| format!("Error: {e}"));

        self.notifier
            .send_notification(installation, &Notification::new(message))
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Echo notification failed"))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let listen = SocketAddr::new(args.host, args.port);
    let server = ServerConfig::new(listen, args.url.as_deref(), &args.state_file)?;

    let addon = AddonConfig::new("echo-addon", "Echo HipChat AddOn")
        .with_description("Example HipChat Addon")
        .with_vendor("davidrjonas", HOMEPAGE)
        .with_homepage(HOMEPAGE)
        .with_scope("send_notification")
        .installable(false, true)
        .with_webhook(
            WebHookSpec::new("echo", "room_message")
                .with_name("Echo")
                .with_pattern(r"^/echo\b.+")
                .with_authentication(AuthenticationMode::Jwt),
        );

    let mut builder = AddOn::builder(addon, server);
    let notifier = builder
        .notifier()
        .context("failed to create notification client")?;

    tracing::info!(state_file = %args.state_file.display(), "Saving state to file");

    let runtime = builder
        .webhook_handler("echo", Arc::new(EchoHandler { notifier }))
        .build()
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Failed to start add-on"))?;

    tracing::info!(
        "Starting server on {} for url {}",
        listen,
        runtime.config().base_url
    );

    runtime.serve().await?;
    Ok(())
}
