//! Route definitions for web server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::{api, AppState};

/// Create the API router.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        // Conversations
        .route("/chats", get(api::list_chats))
        .route("/chats/unassigned", get(api::list_unassigned))
        .route("/chats/:id/assign", post(api::assign_chat))
        .route("/chats/:id/transfer", post(api::transfer_chat))
        .route("/chats/:id/status", post(api::update_status))
        .route("/chats/:id/priority", post(api::set_priority))

        // Messages
        .route("/chats/:id/messages", get(api::list_messages).post(api::send_message))
        .route("/chats/:id/read", post(api::mark_read))

        // Presence
        .route("/sessions/:id/typing", get(api::active_typing).put(api::signal_typing))
        .route("/sessions/:id/typing/stream", get(api::stream_typing))
}

/// Create the full app router.
pub fn create_app_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
