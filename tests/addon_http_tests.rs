//! End-to-end tests for the add-on HTTP surface
//!
//! These tests drive the axum router directly with `oneshot`, the way the
//! host platform would call the add-on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hipchat_addon::config::{AddonConfig, ServerConfig, WebHookSpec};
use hipchat_addon::error::{StorageError, StorageResult};
use hipchat_addon::{
    AddOn, AuthenticationMode, CapabilitiesDescriptor, InboundEvent, Installation,
    MemoryStateStore, SharedStore, StateStore, WebHookDeclaration, WebHookHandler,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

const BASE_URL: &str = "https://addon.example.com";
const SECRET: &str = "s3cr3t";

/// Test handler that counts calls
#[derive(Default)]
struct CountingHandler {
    calls: AtomicU32,
    fail: bool,
}

#[async_trait::async_trait]
impl WebHookHandler for CountingHandler {
    async fn handle(
        &self,
        _installation: &Installation,
        _webhook: &WebHookDeclaration,
        _event: &InboundEvent,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("Simulated failure");
        }
        Ok(())
    }
}

/// Store that knows every installation but cannot read them back
struct UnreadableStore;

#[async_trait::async_trait]
impl StateStore for UnreadableStore {
    async fn get(&self, _id: &str) -> StorageResult<Option<Installation>> {
        Err(StorageError::Serialize("read failed".to_string()))
    }

    async fn put(&self, _installation: Installation) -> StorageResult<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> StorageResult<Option<Installation>> {
        Ok(None)
    }

    async fn list(&self) -> StorageResult<Vec<Installation>> {
        Ok(Vec::new())
    }
}

impl CountingHandler {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Harness {
    addon: AddOn,
    app: Router,
    echo: Arc<CountingHandler>,
    open: Arc<CountingHandler>,
}

async fn harness_with(echo: CountingHandler) -> Harness {
    harness_on(Arc::new(MemoryStateStore::new()), echo).await
}

async fn harness_on(store: SharedStore, echo: CountingHandler) -> Harness {
    let config = AddonConfig::new("echo-addon", "Echo HipChat AddOn")
        .with_description("Example HipChat Addon")
        .with_vendor("davidrjonas", "https://github.com/davidrjonas/hipchat-addon")
        .with_scope("send_notification")
        .with_webhook(
            WebHookSpec::new("echo", "room_message")
                .with_name("Echo")
                .with_pattern(r"^/echo\b"),
        )
        .with_webhook(
            WebHookSpec::new("open", "room_enter")
                .with_authentication(AuthenticationMode::None)
                .with_path("/webhook/open"),
        );
    let server =
        ServerConfig::new("127.0.0.1:0".parse().unwrap(), Some(BASE_URL), "unused").unwrap();

    let echo = Arc::new(echo);
    let open = Arc::new(CountingHandler::default());
    let addon = AddOn::builder(config, server)
        .webhook_handler("echo", echo.clone())
        .webhook_handler("open", open.clone())
        .store(store)
        .build()
        .await
        .unwrap();
    let app = addon.router();

    Harness {
        addon,
        app,
        echo,
        open,
    }
}

async fn harness() -> Harness {
    harness_with(CountingHandler::default()).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn install_body(id: &str, secret: &str) -> Value {
    json!({
        "oauthId": id,
        "oauthSecret": secret,
        "apiUrl": "https://api.example.com/v2/",
        "tokenUrl": "https://api.example.com/v2/oauth/token",
        "groupId": 42,
        "roomId": 7,
        "capabilitiesUrl": "https://api.example.com/v2/capabilities"
    })
}

async fn install(app: &Router, id: &str, secret: &str) {
    let (status, _) = send(
        app,
        json_request(Method::POST, "/install", &install_body(id, secret)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

fn sign(iss: &str, secret: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    encode(
        &Header::new(Algorithm::HS256),
        &json!({ "iss": iss, "sub": "user-1", "iat": now, "exp": now + 300 }),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn fetch_capabilities(app: &Router) -> Vec<u8> {
    let request = Request::get("/capabilities.json").body(Body::empty()).unwrap();
    send(app, request).await.1
}

fn tamper_signature(token: &str) -> String {
    let (message, signature) = token.rsplit_once('.').unwrap();
    let mut bytes = URL_SAFE_NO_PAD.decode(signature).unwrap();
    bytes[0] ^= 0x01;
    format!("{message}.{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn room_message(text: &str) -> Value {
    json!({
        "event": "room_message",
        "item": {
            "message": { "message": text, "from": { "name": "Someone" } },
            "room": { "id": 7, "name": "General" }
        },
        "oauth_client_id": "abc",
        "webhook_id": 1
    })
}

fn webhook_request(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("JWT {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

// ============================================================================
// Manifest
// ============================================================================

#[tokio::test]
async fn test_capabilities_round_trip() {
    let h = harness().await;
    let request = Request::get("/capabilities.json").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let served: CapabilitiesDescriptor = serde_json::from_slice(&body).unwrap();
    assert_eq!(&served, h.addon.descriptor());
    assert_eq!(served.scopes(), ["send_notification".to_string()]);

    let keys: Vec<_> = served.webhooks().iter().map(|w| w.key.as_str()).collect();
    assert_eq!(keys, ["echo", "open"]);
    assert_eq!(served.webhooks()[0].url, format!("{BASE_URL}/webhook/echo"));
    assert_eq!(served.webhooks()[1].url, format!("{BASE_URL}/webhook/open"));

    let raw: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(raw["links"]["self"], format!("{BASE_URL}/capabilities.json"));
    assert_eq!(
        raw["capabilities"]["installable"]["callbackUrl"],
        format!("{BASE_URL}/install")
    );
    assert_eq!(raw["capabilities"]["webhook"][1]["authentication"], "none");
}

#[tokio::test]
async fn test_capabilities_independent_of_installations() {
    let h = harness().await;

    let before = fetch_capabilities(&h.app).await;
    install(&h.app, "abc", SECRET).await;
    assert_eq!(before, fetch_capabilities(&h.app).await);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_install_stores_record() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let stored = h.addon.store().get("abc").await.unwrap().unwrap();
    assert_eq!(stored.secret, SECRET);
    assert_eq!(stored.api_base_url, "https://api.example.com/v2/");
    assert_eq!(stored.room_id.as_deref(), Some("7"));
    assert_eq!(stored.group_id.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_install_keeps_secret_verbatim() {
    let h = harness().await;
    install(&h.app, "abc", " padded secret ").await;

    let stored = h.addon.store().get("abc").await.unwrap().unwrap();
    assert_eq!(stored.secret, " padded secret ");

    let token = sign("abc", " padded secret ");
    let (status, _) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.echo.calls(), 1);
}

#[tokio::test]
async fn test_reinstall_overwrites_credentials() {
    let h = harness().await;
    install(&h.app, "abc", "first").await;
    install(&h.app, "abc", "second").await;

    let all = h.addon.store().list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].secret, "second");
}

#[tokio::test]
async fn test_install_validation_failures() {
    let h = harness().await;

    let missing_secret = json!({ "oauthId": "abc", "apiUrl": "https://api.example.com/" });
    let (status, body) = send(
        &h.app,
        json_request(Method::POST, "/install", &missing_secret),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].as_str().unwrap().contains("secret"));

    let request = Request::post("/install").body(Body::from("not json")).unwrap();
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.addon.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_uninstall_removes_record() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let request = Request::delete("/install/abc").body(Body::empty()).unwrap();
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.addon.store().get("abc").await.unwrap().is_none());
}

#[tokio::test]
async fn test_uninstall_unknown_id_is_success() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let request = Request::delete("/install/ghost").body(Body::empty()).unwrap();
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(h.addon.store().list().await.unwrap().len(), 1);
}

// ============================================================================
// Webhooks
// ============================================================================

#[tokio::test]
async fn test_signed_matching_delivery_reaches_handler_once() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let token = sign("abc", SECRET);
    let (status, _) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.echo.calls(), 1);
}

#[tokio::test]
async fn test_non_matching_delivery_acknowledged_without_callback() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let token = sign("abc", SECRET);
    let (status, _) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/other hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.echo.calls(), 0);
}

#[tokio::test]
async fn test_tampered_token_rejected_before_callback() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let token = tamper_signature(&sign("abc", SECRET));
    let (status, body) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap(),
        json!({ "error": "unauthorized" })
    );
    assert_eq!(h.echo.calls(), 0);
}

#[tokio::test]
async fn test_auth_failures_are_indistinguishable() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let unknown = sign("ghost", SECRET);
    let wrong_secret = sign("abc", "not-the-secret");

    let mut bodies = Vec::new();
    for token in [Some(unknown.as_str()), Some(wrong_secret.as_str()), None] {
        let (status, body) = send(
            &h.app,
            webhook_request("/webhook/echo", token, &room_message("/echo hello")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        bodies.push(body);
    }

    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[1], bodies[2]);
    assert_eq!(h.echo.calls(), 0);
}

#[tokio::test]
async fn test_signed_request_query_parameter_accepted() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let uri = format!("/webhook/echo?signed_request={}", sign("abc", SECRET));
    let (status, _) = send(
        &h.app,
        webhook_request(&uri, None, &room_message("/echo hi")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.echo.calls(), 1);
}

#[tokio::test]
async fn test_uninstalled_installation_can_no_longer_deliver() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;
    let token = sign("abc", SECRET);

    let request = Request::delete("/install/abc").body(Body::empty()).unwrap();
    send(&h.app, request).await;

    let (status, _) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.echo.calls(), 0);
}

#[tokio::test]
async fn test_store_failure_during_auth_is_server_error() {
    let h = harness_on(Arc::new(UnreadableStore), CountingHandler::default()).await;

    let token = sign("abc", SECRET);
    let (status, body) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_ne!(
        serde_json::from_slice::<Value>(&body).unwrap(),
        json!({ "error": "unauthorized" })
    );

    let event = json!({ "event": "room_enter", "oauth_client_id": "abc" });
    let (status, _) = send(&h.app, webhook_request("/webhook/open", None, &event)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(h.echo.calls(), 0);
    assert_eq!(h.open.calls(), 0);
    assert_eq!(h.addon.stats().counters().auth_failures, 0);
}

#[tokio::test]
async fn test_handler_failure_is_server_error() {
    let h = harness_with(CountingHandler {
        calls: AtomicU32::new(0),
        fail: true,
    })
    .await;
    install(&h.app, "abc", SECRET).await;

    let token = sign("abc", SECRET);
    let (status, _) = send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.echo.calls(), 1);
    assert_eq!(h.addon.stats().counters().callback_errors, 1);
}

#[tokio::test]
async fn test_malformed_event_body_rejected() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let token = sign("abc", SECRET);
    let request = Request::post("/webhook/echo")
        .header(header::AUTHORIZATION, format!("JWT {token}"))
        .body(Body::from("[1, 2, 3]"))
        .unwrap();
    let (status, _) = send(&h.app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.echo.calls(), 0);
}

#[tokio::test]
async fn test_unauthenticated_webhook_resolves_installation_from_event() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let event = json!({ "event": "room_enter", "oauth_client_id": "abc" });
    let (status, _) = send(&h.app, webhook_request("/webhook/open", None, &event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.open.calls(), 1);

    let unknown = json!({ "event": "room_enter", "oauth_client_id": "ghost" });
    let (status, _) = send(&h.app, webhook_request("/webhook/open", None, &unknown)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.open.calls(), 1);
}

// ============================================================================
// Operational endpoints
// ============================================================================

#[tokio::test]
async fn test_health_and_status() {
    let h = harness().await;
    install(&h.app, "abc", SECRET).await;

    let token = sign("abc", SECRET);
    send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("/echo hello")),
    )
    .await;
    send(
        &h.app,
        webhook_request("/webhook/echo", Some(&token), &room_message("nothing")),
    )
    .await;

    let (status, body) = send(&h.app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_slice::<Value>(&body).unwrap(),
        json!({ "status": "healthy" })
    );

    let (status, body) = send(&h.app, Request::get("/status").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let status: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["installations"], 1);
    assert_eq!(status["counters"]["installs"], 1);
    assert_eq!(status["counters"]["webhooks_received"], 2);
    assert_eq!(status["counters"]["webhooks_delivered"], 1);
    assert_eq!(status["counters"]["webhooks_ignored"], 1);
}
