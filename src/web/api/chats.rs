//! API endpoints for conversations.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::core::assignment::{QueueEntry, Transfer};
use crate::core::models::{parse_status_list, ChatFilters, ChatStatus, Priority};
use crate::core::ChatView;
use crate::error::Error;
use crate::web::{ApiError, ApiJson, AppState, Credential};

/// Listing query string: `?status=OPEN,WAITING&priority=HIGH&source=widget&limit=20&offset=0`.
#[derive(Deserialize, Debug, Default)]
pub struct ChatQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ChatQuery {
    /// Overlay the query onto a view's default filters.
    pub fn into_filters(self, defaults: ChatFilters, default_limit: u32) -> Result<ChatFilters, Error> {
        let mut filters = defaults.with_page(
            self.limit.unwrap_or(default_limit),
            self.offset.unwrap_or(0),
        );
        if let Some(raw) = self.status.as_deref().filter(|s| !s.trim().is_empty()) {
            filters = filters.with_status(parse_status_list(raw)?);
        }
        if let Some(raw) = self.priority.as_deref().filter(|s| !s.trim().is_empty()) {
            filters = filters.with_priority(raw.parse()?);
        }
        if let Some(source) = self.source.as_deref().filter(|s| !s.trim().is_empty()) {
            filters = filters.with_source(source.trim());
        }
        filters.validate()?;
        Ok(filters)
    }
}

/// Transfer request.
#[derive(Deserialize)]
pub struct TransferRequest {
    pub to_agent_id: String,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: ChatStatus,
}

#[derive(Deserialize)]
pub struct PriorityRequest {
    pub priority: Priority,
}

/// List the caller's conversations.
pub async fn list_chats(
    State(state): State<AppState>,
    Credential(token): Credential,
    Query(query): Query<ChatQuery>,
) -> Result<Json<Vec<ChatView>>, ApiError> {
    let filters = query.into_filters(ChatFilters::assigned(), state.default_limit)?;
    Ok(Json(state.facade.list_my_chats(&token, filters).await?))
}

/// Ranked unassigned queue.
pub async fn list_unassigned(
    State(state): State<AppState>,
    Credential(token): Credential,
    Query(query): Query<ChatQuery>,
) -> Result<Json<Vec<QueueEntry>>, ApiError> {
    let filters = query.into_filters(ChatFilters::unassigned(), state.default_limit)?;
    Ok(Json(state.facade.list_unassigned_queue(&token, filters).await?))
}

pub async fn assign_chat(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
) -> Result<Json<ChatView>, ApiError> {
    Ok(Json(state.facade.assign(&token, &id).await?))
}

pub async fn transfer_chat(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<TransferRequest>,
) -> Result<Json<Transfer>, ApiError> {
    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    Ok(Json(
        state
            .facade
            .transfer(&token, &id, payload.to_agent_id.trim(), reason)
            .await?,
    ))
}

pub async fn update_status(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<StatusRequest>,
) -> Result<Json<ChatView>, ApiError> {
    Ok(Json(state.facade.update_status(&token, &id, payload.status).await?))
}

pub async fn set_priority(
    State(state): State<AppState>,
    Credential(token): Credential,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<PriorityRequest>,
) -> Result<Json<ChatView>, ApiError> {
    Ok(Json(state.facade.set_priority(&token, &id, payload.priority).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_overlays_defaults() {
        let filters = ChatQuery::default()
            .into_filters(ChatFilters::assigned(), 20)
            .unwrap();
        assert_eq!(filters, ChatFilters::assigned());

        let query = ChatQuery {
            status: Some("waiting".to_string()),
            priority: Some("urgent".to_string()),
            source: Some(" email ".to_string()),
            limit: Some(5),
            offset: Some(10),
        };
        let filters = query.into_filters(ChatFilters::assigned(), 20).unwrap();
        assert_eq!(filters.status.len(), 1);
        assert!(filters.status.contains(&ChatStatus::Waiting));
        assert_eq!(filters.priority, Some(Priority::Urgent));
        assert_eq!(filters.source.as_deref(), Some("email"));
        assert_eq!((filters.limit, filters.offset), (5, 10));
    }

    #[test]
    fn test_query_rejects_bad_values() {
        let bad_status = ChatQuery {
            status: Some("OPEN,archived".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            bad_status.into_filters(ChatFilters::assigned(), 20),
            Err(Error::Validation(_))
        ));

        let zero = ChatQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert!(zero.into_filters(ChatFilters::unassigned(), 20).is_err());
    }
}
