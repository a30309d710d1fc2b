use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{
    auth::{ConnectionAuthenticator, Handshake},
    completion::{CompletionService, OpenAiCompletion},
    config::AppConfig,
    connection::Connection,
    error::{AppError, Result},
    platform::{DefaultPlatformFactory, PlatformFactory},
    presence::PresenceTracker,
    realtime::RealtimeHub,
    relay::MessageRelay,
    store::{BehaviorLog, ConversationStore, PgStore},
    telemetry::init_tracing_from_env,
    types::now_iso,
};

pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub authenticator: ConnectionAuthenticator,
    pub relay: MessageRelay,
    pub hub: Arc<RealtimeHub>,
    pub presence: PresenceTracker,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        behavior_log: Arc<dyn BehaviorLog>,
        completion: Arc<dyn CompletionService>,
        platforms: Arc<dyn PlatformFactory>,
        api_key_prefix: impl Into<String>,
        history_window: usize,
    ) -> Self {
        Self {
            authenticator: ConnectionAuthenticator::new(
                store.clone(),
                behavior_log,
                completion.clone(),
                platforms,
                api_key_prefix,
            ),
            relay: MessageRelay::new(store.clone(), completion, history_window),
            store,
            hub: Arc::new(RealtimeHub::new()),
            presence: PresenceTracker::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/presence", get(list_presence))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceQuery {
    shop_id: Option<i64>,
}

async fn list_presence(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PresenceQuery>,
) -> impl IntoResponse {
    let Some(shop_id) = query.shop_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "shopId is required" })),
        );
    };
    let visitors = state.presence.online(shop_id).await;
    (StatusCode::OK, Json(json!({ "visitors": visitors })))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(handshake): Query<Handshake>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, handshake: Handshake) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut connection = Connection::new(state, tx).await;
    if connection.authenticate(&handshake).await.is_ok() {
        while let Some(Ok(message)) = ws_receiver.next().await {
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            if connection.handle_text(&text).await.is_break() {
                break;
            }
        }
    }

    // Unregistering drops the last sender, so the writer drains and closes the socket.
    connection.close().await;
    if let Err(err) = send_task.await {
        debug!(error = %err, "socket writer ended abnormally");
    }
}

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing_from_env();

    let db = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .map_err(|err| AppError::database(format!("failed to run migrations: {err}")))?;

    let pg = Arc::new(PgStore::new(db));
    let completion = Arc::new(OpenAiCompletion::new(&config)?);
    let platforms = Arc::new(DefaultPlatformFactory::new(reqwest::Client::new()));
    let state = Arc::new(AppState::new(
        pg.clone(),
        pg,
        completion,
        platforms,
        config.api_key_prefix.clone(),
        config.history_window,
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::internal(format!("failed to bind {addr}: {err}")))?;

    info!(port = config.port, "storefront assistant listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|err| AppError::internal(format!("server runtime failure: {err}")))
}
