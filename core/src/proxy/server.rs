//! Chat Server - Axum HTTP server

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::proxy::handlers::chat::{handle_chat, handle_chat_stream};
use crate::proxy::service::ChatService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub expose_error_details: bool,
}

/// Chat server instance
pub struct ChatServer {
    host: String,
    port: u16,
    body_limit_bytes: usize,
    state: AppState,
}

impl ChatServer {
    pub fn new(config: &Config, chat: Arc<ChatService>) -> Self {
        let state = AppState {
            chat,
            expose_error_details: config.errors.expose_details,
        };

        Self {
            host: config.server.get_bind_address().to_string(),
            port: config.server.port,
            body_limit_bytes: config.server.body_limit_mb.max(1) * 1024 * 1024,
            state,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.body_limit_bytes)
    }

    /// Run the server (blocking)
    pub async fn run(self) -> anyhow::Result<()> {
        let app = self.router();

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Chat server listening on {}", addr);

        // Handle graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Chat server stopped");
        Ok(())
    }
}

pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check_handler))
        .route("/api/health", get(health_check_handler))

        // Chat
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))

        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_check_handler() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "message": "Nutrik.AI Backend is running"
        })),
    )
        .into_response()
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
