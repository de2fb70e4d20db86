//! API endpoints for typing presence.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use tokio_stream::{Stream, StreamExt};

use crate::bus::TypingEvent;
use crate::core::models::TypingIndicator;
use crate::web::{ApiError, ApiJson, AppState, Credential};

#[derive(Deserialize)]
pub struct TypingRequest {
    pub is_typing: bool,
    pub chat_id: Option<String>,
}

pub async fn signal_typing(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(session_id): Path<String>,
    ApiJson(payload): ApiJson<TypingRequest>,
) -> Result<Json<TypingEvent>, ApiError> {
    Ok(Json(
        state
            .facade
            .signal_typing(&token, &session_id, payload.is_typing, payload.chat_id.as_deref())
            .await?,
    ))
}

/// Persisted indicators still live, for viewers joining late.
pub async fn active_typing(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<TypingIndicator>>, ApiError> {
    Ok(Json(state.facade.active_typing(&token, &session_id).await?))
}

/// Live typing events for a session as server-sent events. The subscription
/// is released when the client disconnects.
pub async fn stream_typing(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let subscription = state.facade.subscribe_typing(&token, &session_id).await?;
    tracing::debug!("Streaming typing events for session {}", session_id);

    let events = subscription.map(|event| Event::default().event(event.kind()).json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
