//! API endpoints for conversation messages.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::core::models::{MessageOrder, MessageType, Page};
use crate::core::{MessageView, ReadReceipt};
use crate::web::{ApiError, ApiJson, AppState, Credential};

#[derive(Deserialize, Debug, Default)]
pub struct MessagesQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    #[serde(default)]
    pub order: MessageOrder,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub message_ids: Vec<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let defaults = Page::default();
    let page = Page {
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    };
    Ok(Json(
        state
            .facade
            .get_messages(&token, &id, page, query.order)
            .await?,
    ))
}

pub async fn send_message(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageView>), ApiError> {
    let view = state
        .facade
        .send_message(&token, &id, &payload.content, payload.message_type)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<MarkReadRequest>,
) -> Result<Json<ReadReceipt>, ApiError> {
    Ok(Json(
        state
            .facade
            .mark_read(&token, &id, &payload.message_ids)
            .await?,
    ))
}
