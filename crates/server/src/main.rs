use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use session_core::SessionManager;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationCountResponse, ConversationListResponse, DisconnectResponse,
        InitializeResponse, MessageListResponse, PairingArtifactResponse,
        RestoreSessionResponse, SendMessageRequest, SendMessageResponse, StatusResponse,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use crate::config::{chat_client_factory, load_settings};
use api::ApiContext;
use app_state::AppState;

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    let sessions = Arc::new(SessionManager::new(
        settings.session.clone(),
        chat_client_factory(&settings),
    ));
    info!(
        transport = ?settings.transport,
        credentials_root = %settings.session.credentials_root.display(),
        "session manager ready"
    );

    let state = AppState {
        api: ApiContext {
            sessions: Arc::clone(&sessions),
        },
    };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped; disconnecting sessions");
    sessions.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions/:user_id/initialize", post(http_initialize))
        .route("/sessions/:user_id/restore", post(http_restore))
        .route("/sessions/:user_id/qr", get(http_pairing_artifact))
        .route("/sessions/:user_id/status", get(http_status))
        .route("/sessions/:user_id/disconnect", post(http_disconnect))
        .route(
            "/sessions/:user_id/conversations",
            get(http_list_conversations),
        )
        .route(
            "/sessions/:user_id/conversations/count",
            get(http_count_conversations),
        )
        .route(
            "/sessions/:user_id/conversations/:conversation_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::AuthFailure => StatusCode::UNAUTHORIZED,
        ErrorCode::Transport => StatusCode::BAD_GATEWAY,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

/// Malformed or oversized JSON bodies keep the `ApiError` shape.
fn reject_body(rejection: JsonRejection) -> (StatusCode, Json<ApiError>) {
    let status = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiError::new(ErrorCode::Validation, rejection.body_text())),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_initialize(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<InitializeResponse> {
    api::initialize(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_restore(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<RestoreSessionResponse> {
    api::restore(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_pairing_artifact(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<PairingArtifactResponse> {
    api::pairing_artifact(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<StatusResponse> {
    api::status(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_disconnect(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<DisconnectResponse> {
    api::disconnect(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<ConversationListResponse> {
    api::list_conversations(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_count_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> HttpResult<ConversationCountResponse> {
    api::count_conversations(&state.api, &user_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path((user_id, conversation_id)): Path<(String, String)>,
) -> HttpResult<MessageListResponse> {
    api::list_messages(&state.api, &user_id, &conversation_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> HttpResult<SendMessageResponse> {
    let Json(req) = body.map_err(reject_body)?;
    api::send_message(&state.api, &user_id, &conversation_id, req)
        .await
        .map(Json)
        .map_err(reject)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
