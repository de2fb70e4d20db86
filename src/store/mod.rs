//! Record store - the transactional persistence seam the engine is built on.
//!
//! Components receive an `Arc<dyn RecordStore>` at construction. The only
//! shipped backend is SQLite (`sqlite::SqliteStore`); any store that can
//! offer a conditional update keyed on the current assignee and status can
//! stand in for it.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::core::models::{
    Agent, AuditEntry, ChatFilters, ChatStatus, Conversation, ConversationSession, Customer,
    Message, Page, Priority, TypingIndicator,
};
use crate::error::Result;

pub use sqlite::SqliteStore;

/// Which assignee a conversation listing is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignee {
    Agent(String),
    Nobody,
}

/// Conversation listing query. Results are ordered by most recent activity
/// (`last_message_at` descending, never-messaged last, then `created_at`
/// descending).
#[derive(Debug, Clone)]
pub struct ConversationQuery {
    pub assignee: Assignee,
    pub status: BTreeSet<ChatStatus>,
    pub priority: Option<Priority>,
    pub source: Option<String>,
    /// `None` returns every match.
    pub page: Option<Page>,
}

impl ConversationQuery {
    pub fn new(assignee: Assignee, filters: &ChatFilters) -> Self {
        Self {
            assignee,
            status: filters.status.clone(),
            priority: filters.priority,
            source: filters.source.clone(),
            page: Some(Page {
                limit: filters.limit,
                offset: filters.offset,
            }),
        }
    }

    pub fn unpaged(mut self) -> Self {
        self.page = None;
        self
    }
}

/// Expected current assignee for a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssigneeGuard {
    Unassigned,
    AssignedTo(String),
}

/// Predicate a conditional update must match to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationGuard {
    pub assignee: AssigneeGuard,
    pub status: ChatStatus,
}

impl ConversationGuard {
    /// Guard matching the conversation exactly as it was observed.
    pub fn observed(conversation: &Conversation) -> Self {
        Self {
            assignee: match &conversation.assigned_agent_id {
                Some(id) => AssigneeGuard::AssignedTo(id.clone()),
                None => AssigneeGuard::Unassigned,
            },
            status: conversation.status,
        }
    }
}

/// Fields to change. `None` leaves the column untouched; changing `status`
/// also resets `status_changed_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPatch {
    pub assigned_agent_id: Option<Option<String>>,
    pub status: Option<ChatStatus>,
    pub priority: Option<Priority>,
}

/// Outcome of folding one customer record into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub messages_moved: usize,
    pub conversations_moved: usize,
    pub sessions_moved: usize,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_customer(&self, customer: &Customer) -> Result<()>;
    async fn find_customer(&self, id: &str) -> Result<Option<Customer>>;
    /// Customers sharing an email (case-insensitive), oldest first in each group.
    async fn duplicate_customer_groups(&self) -> Result<Vec<Vec<Customer>>>;
    /// Re-point messages, conversations and sessions of `from` to `to`, then
    /// delete `from`. All or nothing.
    async fn merge_customers(&self, from: &str, to: &str) -> Result<MergeReport>;

    async fn insert_session(&self, session: &ConversationSession) -> Result<()>;
    async fn find_session(&self, id: &str) -> Result<Option<ConversationSession>>;

    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;
    async fn find_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn touch_agent(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()>;
    /// Soft-deleted conversations are reported as absent.
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    async fn list_conversations(&self, query: &ConversationQuery) -> Result<Vec<Conversation>>;
    /// Apply `patch` only if the row still matches `guard`.
    ///
    /// Fails with `Error::Conflict` when the guard no longer holds and
    /// `Error::NotFound` when the conversation does not exist.
    async fn update_conversation_if(
        &self,
        id: &str,
        guard: &ConversationGuard,
        patch: &ConversationPatch,
        now: DateTime<Utc>,
    ) -> Result<Conversation>;

    /// Insert a message and update the conversation and session counters in
    /// one transaction. Returns the updated conversation.
    async fn append_message(&self, message: &Message) -> Result<Conversation>;
    /// A page counted from the newest message, returned newest first.
    async fn list_messages(&self, chat_id: &str, page: Page) -> Result<Vec<Message>>;
    /// Mark the listed messages of `chat_id` read, ignoring unknown ids, and
    /// recompute the unread count as seen by `reader_id`. Returns the number
    /// of messages newly marked and the updated conversation.
    async fn mark_messages_read(
        &self,
        chat_id: &str,
        message_ids: &[String],
        reader_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(usize, Conversation)>;

    /// Create or refresh the indicator for (session, user).
    async fn upsert_typing(
        &self,
        session_id: &str,
        chat_id: Option<&str>,
        user_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TypingIndicator>;
    async fn delete_typing(&self, session_id: &str, user_id: &str) -> Result<bool>;
    /// Indicators still typing and not expired at `now`.
    async fn active_typing(&self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<TypingIndicator>>;
    async fn delete_expired_typing(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()>;
    async fn list_audit(&self, chat_id: &str) -> Result<Vec<AuditEntry>>;
}
