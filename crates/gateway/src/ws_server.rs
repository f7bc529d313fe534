//! HTTP surface: WebSocket admission plus account and health routes.

use crate::auth::redis::take_expire;
use crate::auth::{AuthOutcome, Authenticator, RedisAccounts, TokenAuth};
use crate::connection::{split_socket, ConnectionConfig, DuplexConnection};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::session::serve_client;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub auth: Arc<dyn Authenticator>,
    /// Present in redis mode.
    pub accounts: Option<Arc<RedisAccounts>>,
    /// Present in token mode.
    pub tokens: Option<Arc<TokenAuth>>,
    pub connection: ConnectionConfig,
    pub host_name: String,
    /// Per-request tracing.
    pub debug: bool,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let debug = state.debug;
    let app = Router::new()
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/mqtt", get(mqtt_handler))
        .route("/account/wjt/{id}", get(issue_token_handler))
        .route("/account/redis", post(create_account_handler))
        .route(
            "/account/redis/{username}",
            get(get_account_handler)
                .put(update_account_handler)
                .delete(delete_account_handler),
        )
        .fallback(not_found_handler)
        .with_state(state)
        .layer(CorsLayer::permissive());

    if debug {
        app.layer(TraceLayer::new_for_http())
    } else {
        app
    }
}

/// `{code, message, data?}` envelope used by every JSON route.
#[derive(Debug, Serialize)]
struct ApiReply {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn ok(data: Option<Value>) -> Response {
    let reply = ApiReply {
        code: 1,
        message: "OK".to_string(),
        data,
    };
    (StatusCode::OK, Json(reply)).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    let reply = ApiReply {
        code: -1,
        message: message.into(),
        data: None,
    };
    (status, Json(reply)).into_response()
}

fn bad_parameters() -> Response {
    fail(StatusCode::BAD_REQUEST, "invalid parameters")
}

fn mode_mismatch(state: &AppState) -> Response {
    fail(
        StatusCode::BAD_REQUEST,
        format!("auth mode mismatch#{}", state.auth.mode()),
    )
}

async fn ping_handler() -> &'static str {
    "PONG"
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let subscriptions = state.router.subscriptions();
    Json(json!({
        "status": "ok",
        "host": state.host_name,
        "clients": state.registry.len(),
        "topics": subscriptions.topic_count(),
        "subscriptions": subscriptions.subscription_count(),
        "broker": state.router.broker().state().as_str(),
    }))
}

async fn not_found_handler(method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let reply = ApiReply {
        code: -1,
        message: "404, page not exists!".to_string(),
        data: Some(json!({
            "host": host,
            "method": method.as_str(),
            "path": uri.path(),
        })),
    };
    (StatusCode::NOT_FOUND, Json(reply)).into_response()
}

/// `/mqtt` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Authenticate, then upgrade and serve the control protocol.
async fn mqtt_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AdmissionParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if params.client_id.is_empty() {
        return bad_parameters();
    }
    let mode = state.auth.mode();
    if mode.requires_username() && params.username.is_empty() {
        return bad_parameters();
    }

    match state
        .auth
        .authenticate(&params.username, &params.password)
        .await
    {
        Ok(AuthOutcome::Granted) => {}
        Ok(AuthOutcome::UnknownAccount) => {
            return fail(StatusCode::GONE, "account does not exist");
        }
        Ok(AuthOutcome::Denied(reason)) => {
            debug!("Admission of {} denied: {}", params.client_id, reason);
            return fail(StatusCode::BAD_REQUEST, reason);
        }
        Err(e) => {
            warn!("{} authentication failed: {}", mode, e);
            return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let client_id = params.client_id;
    ws.on_upgrade(move |socket| async move {
        let (source, sink) = split_socket(socket);
        let conn = DuplexConnection::spawn(
            client_id.clone(),
            source,
            sink,
            state.connection.clone(),
        );
        serve_client(state.registry.clone(), state.router.clone(), client_id, conn).await;
    })
}

async fn issue_token_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(tokens) = state.tokens.as_ref() else {
        return mode_mismatch(&state);
    };
    let id = match id.parse::<i64>() {
        Ok(id) if id > 0 => id,
        _ => return bad_parameters(),
    };
    match tokens.issue(id) {
        Ok(token) => ok(Some(Value::String(token))),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

type AccountBody = Result<Json<HashMap<String, String>>, JsonRejection>;

async fn create_account_handler(
    State(state): State<Arc<AppState>>,
    body: AccountBody,
) -> Response {
    let Some(accounts) = state.accounts.as_ref() else {
        return mode_mismatch(&state);
    };
    let mut fields = match body {
        Ok(Json(fields)) => fields,
        Err(rejection) => return fail(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(username) = fields.get("username").cloned() else {
        return fail(StatusCode::BAD_REQUEST, "username is empty");
    };
    if !fields.contains_key("password") {
        return fail(StatusCode::BAD_REQUEST, "password is empty");
    }
    let expire = take_expire(&mut fields);

    match accounts.create(&username, &fields, expire).await {
        Ok(()) => ok(None),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_account_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    let Some(accounts) = state.accounts.as_ref() else {
        return mode_mismatch(&state);
    };
    match accounts.get(&username).await {
        Ok(fields) => ok(Some(json!(fields))),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn update_account_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    body: AccountBody,
) -> Response {
    let Some(accounts) = state.accounts.as_ref() else {
        return mode_mismatch(&state);
    };
    let mut fields = match body {
        Ok(Json(fields)) => fields,
        Err(rejection) => return fail(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let expire = take_expire(&mut fields);

    match accounts.update(&username, &fields, expire).await {
        Ok(true) => ok(None),
        Ok(false) => fail(StatusCode::GONE, "account does not exist"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_account_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    let Some(accounts) = state.accounts.as_ref() else {
        return mode_mismatch(&state);
    };
    match accounts.delete(&username).await {
        Ok(true) => ok(None),
        Ok(false) => fail(StatusCode::GONE, "account does not exist"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMode, OpenAuth};
    use crate::config::TokenConfig;
    use crate::error::{GatewayError, Result};
    use crate::router::RouterConfig;
    use crate::subscription::SubscriptionRouter;
    use amqp_client::{BrokerClient, BrokerConfig, MemoryTransport};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Authenticator with a canned answer.
    struct Canned(AuthMode, Option<AuthOutcome>);

    #[async_trait]
    impl Authenticator for Canned {
        fn mode(&self) -> AuthMode {
            self.0
        }

        async fn authenticate(&self, _username: &str, _password: &str) -> Result<AuthOutcome> {
            self.1
                .clone()
                .ok_or_else(|| GatewayError::Config("backend down".to_string()))
        }
    }

    fn token_auth() -> Arc<TokenAuth> {
        Arc::new(TokenAuth::new(&TokenConfig {
            secret: "s3cret".to_string(),
            expire: Duration::from_secs(300),
            issuer: "gateway".to_string(),
        }))
    }

    async fn app(auth: Arc<dyn Authenticator>, tokens: Option<Arc<TokenAuth>>) -> Router {
        let broker = BrokerClient::init(
            Arc::new(MemoryTransport::new()),
            BrokerConfig::default(),
            &[],
        )
        .await
        .unwrap();
        let router = Arc::new(MessageRouter::new(
            broker,
            Arc::new(SubscriptionRouter::new()),
            RouterConfig {
                publish_topic: "gateway.out".to_string(),
                subscribe_topic: "gateway.in".to_string(),
            },
        ));
        create_router(Arc::new(AppState {
            registry: Arc::new(ConnectionRegistry::new()),
            router,
            auth,
            accounts: None,
            tokens,
            connection: ConnectionConfig::default(),
            host_name: "gw-test".to_string(),
            debug: false,
        }))
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "gw.local")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn json_body(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, body) = call(app(Arc::new(OpenAuth), None).await, Method::GET, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "PONG");
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(app(Arc::new(OpenAuth), None).await, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["host"], "gw-test");
        assert_eq!(body["clients"], 0);
        assert_eq!(body["broker"], "connected");
    }

    #[tokio::test]
    async fn test_not_found_fallback() {
        let (status, body) = call(
            app(Arc::new(OpenAuth), None).await,
            Method::DELETE,
            "/nowhere",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json_body(&body);
        assert_eq!(body["code"], -1);
        assert_eq!(body["data"]["host"], "gw.local");
        assert_eq!(body["data"]["method"], "DELETE");
        assert_eq!(body["data"]["path"], "/nowhere");
    }

    #[tokio::test]
    async fn test_mqtt_requires_client_id() {
        let (status, body) = call(app(Arc::new(OpenAuth), None).await, Method::GET, "/mqtt").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["code"], -1);
    }

    #[tokio::test]
    async fn test_mqtt_requires_username_outside_open_mode() {
        let auth = Arc::new(Canned(AuthMode::Redis, Some(AuthOutcome::Granted)));
        let (status, _) = call(app(auth, None).await, Method::GET, "/mqtt?clientId=c1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mqtt_maps_auth_outcomes() {
        let uri = "/mqtt?clientId=c1&username=alice&password=pw";

        let unknown = Arc::new(Canned(AuthMode::Redis, Some(AuthOutcome::UnknownAccount)));
        let (status, _) = call(app(unknown, None).await, Method::GET, uri).await;
        assert_eq!(status, StatusCode::GONE);

        let denied = Arc::new(Canned(
            AuthMode::Redis,
            Some(AuthOutcome::Denied("password is wrong".to_string())),
        ));
        let (status, body) = call(app(denied, None).await, Method::GET, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["message"], "password is wrong");

        let broken = Arc::new(Canned(AuthMode::Mysql, None));
        let (status, _) = call(app(broken, None).await, Method::GET, uri).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_mqtt_token_mode_rejects_bad_token() {
        let tokens = token_auth();
        let (status, _) = call(
            app(tokens.clone(), Some(tokens)).await,
            Method::GET,
            "/mqtt?clientId=c1&username=not-a-token",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_issue_token() {
        let tokens = token_auth();
        let app = app(tokens.clone(), Some(tokens.clone())).await;

        let (status, body) = call(app.clone(), Method::GET, "/account/wjt/42").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["code"], 1);
        let token = body["data"].as_str().unwrap();
        assert_eq!(tokens.verify(token).unwrap().id, 42);

        let (status, _) = call(app.clone(), Method::GET, "/account/wjt/0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app, Method::GET, "/account/wjt/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_account_routes_check_mode() {
        let app = app(Arc::new(OpenAuth), None).await;

        let (status, body) = call(app.clone(), Method::GET, "/account/wjt/1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["message"], "auth mode mismatch#open");

        let (status, _) = call(app.clone(), Method::GET, "/account/redis/alice").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app, Method::DELETE, "/account/redis/alice").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
