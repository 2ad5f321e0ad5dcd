//! HTTP surface: `POST /api/v1/hackrx/run` and `GET /health`.

pub mod auth;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use self::auth::{validate_auth, AuthMode};
use crate::config::ServerConfig;
use crate::error::{RagError, RagResult};
use crate::pipeline::Pipeline;
use crate::source::is_remote_locator;
use crate::synthesis::QuestionAnswer;

/// Shared state for the Axum server.
#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    pub auth_mode: AuthMode,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub documents: String,
    #[serde(default)]
    pub questions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub answers: Vec<QuestionAnswer>,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { status: "error", error: error.into() })).into_response()
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/v1/hackrx/run", post(run_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn run_handler(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    // 1. Auth
    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    if let Err(rejection) = validate_auth(&state.auth_mode, auth_header) {
        tracing::warn!(reason = rejection.message(), "Run request rejected");
        return error_response(StatusCode::UNAUTHORIZED, rejection.message());
    }

    // 2. Parse body
    let request: RunRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid request body: {e}")),
    };
    if request.documents.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "documents must name a document");
    }
    if !is_remote_locator(&request.documents) {
        tracing::warn!(document = %request.documents, "Run request rejected: not an http(s) URL");
        return error_response(StatusCode::BAD_REQUEST, "documents must be an http or https URL");
    }
    tracing::info!(document = %request.documents, questions = request.questions.len(), "Run requested");

    // 3. Prepare the document, then answer in order
    match state.pipeline.run(&request.documents, &request.questions).await {
        Ok(answers) => (StatusCode::OK, Json(RunResponse { answers })).into_response(),
        Err(e) => {
            tracing::error!(document = %request.documents, error = %e, "Document preparation failed");
            error_response(preparation_status(&e), e.to_string())
        }
    }
}

fn preparation_status(e: &RagError) -> StatusCode {
    match e {
        RagError::InvalidLocator(_) => StatusCode::BAD_REQUEST,
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A running server. Dropping it without [`ServerHandle::stop`] leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Bind and start serving in the background.
pub async fn start_server(pipeline: Arc<Pipeline>, config: &ServerConfig) -> RagResult<ServerHandle> {
    let state = ServerState {
        pipeline,
        auth_mode: AuthMode::from_token(config.auth_token.as_deref()),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| RagError::Io(format!("Failed to bind {}:{}: {e}", config.host, config.port)))?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tracing::info!("Server starting on http://{addr}");

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutting down");
            })
            .await
        {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle { addr, shutdown: shutdown_tx, task })
}
