//! Assignment manager.
//!
//! Sole writer of conversation ownership, status and priority. Every write
//! is a conditional update against the state observed just before it, so a
//! racing writer surfaces as `Error::Conflict` instead of a lost update.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::models::{ChatFilters, ChatStatus, Conversation, Customer, Priority};
use super::scoring;
use crate::error::{Error, Result};
use crate::store::{
    Assignee, ConversationGuard, ConversationPatch, ConversationQuery, MergeReport, RecordStore,
};

/// Unassigned conversation annotated for the queue view.
#[derive(Serialize, Clone, Debug)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub chat: Conversation,
    #[serde(skip)]
    pub waiting_time: Duration,
    pub waiting_seconds: i64,
    pub waiting_time_formatted: String,
    pub priority_score: i64,
}

impl QueueEntry {
    pub fn new(chat: Conversation, now: DateTime<Utc>) -> Self {
        let waiting_time = scoring::waiting_time(&chat, now);
        Self {
            priority_score: scoring::score_conversation(&chat, now),
            waiting_seconds: waiting_time.num_seconds(),
            waiting_time_formatted: scoring::format_waiting_time(waiting_time),
            waiting_time,
            chat,
        }
    }
}

/// Result of a write that may have been a no-op.
#[derive(Serialize, Clone, Debug)]
pub struct Change {
    pub chat: Conversation,
    pub changed: bool,
}

/// Ownership hand-over. `reason` is metadata only.
#[derive(Serialize, Clone, Debug)]
pub struct Transfer {
    pub chat: Conversation,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
    pub changed: bool,
}

/// One duplicate customer folded into the surviving record.
#[derive(Serialize, Clone, Debug)]
pub struct MergeOutcome {
    pub kept_customer_id: String,
    pub merged_customer_id: String,
    pub report: MergeReport,
}

fn status_transition_allowed(from: ChatStatus, to: ChatStatus) -> bool {
    use ChatStatus::*;
    matches!(
        (from, to),
        (InProgress, Waiting) | (Waiting, InProgress) | (Open | InProgress | Waiting, Closed)
    )
}

pub struct AssignmentManager {
    store: Arc<dyn RecordStore>,
}

impl AssignmentManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn load(&self, chat_id: &str) -> Result<Conversation> {
        self.store
            .find_conversation(chat_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))
    }

    /// Re-read after a lost conditional update and report what happened.
    async fn lost_race(&self, chat_id: &str, err: Error) -> Error {
        if !matches!(err, Error::Conflict(_)) {
            return err;
        }
        match self.store.find_conversation(chat_id).await {
            Ok(Some(current)) if current.status.is_terminal() => {
                Error::InvalidState(format!("chat {} was closed", chat_id))
            }
            Ok(None) => Error::NotFound(format!("chat {}", chat_id)),
            _ => err,
        }
    }

    pub async fn list_agent_chats(&self, agent_id: &str, filters: &ChatFilters) -> Result<Vec<Conversation>> {
        filters.validate()?;
        let query = ConversationQuery::new(Assignee::Agent(agent_id.to_string()), filters);
        self.store.list_conversations(&query).await
    }

    /// Every unassigned conversation matching `filters`, unranked and
    /// unpaged. Ranking and truncation happen in the caller.
    pub async fn list_unassigned_chats(&self, filters: &ChatFilters, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        filters.validate()?;
        let query = ConversationQuery::new(Assignee::Nobody, filters).unpaged();
        let chats = self.store.list_conversations(&query).await?;
        Ok(chats.into_iter().map(|chat| QueueEntry::new(chat, now)).collect())
    }

    pub async fn assign(&self, chat_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Change> {
        let chat = self.load(chat_id).await?;
        if self.store.find_agent(agent_id).await?.is_none() {
            return Err(Error::NotFound(format!("agent {}", agent_id)));
        }
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }
        match chat.assigned_agent_id.as_deref() {
            Some(owner) if owner == agent_id => {
                return Ok(Change { chat, changed: false });
            }
            Some(_) => {
                return Err(Error::Conflict(format!(
                    "chat {} is already assigned to another agent; re-fetch before retrying",
                    chat_id
                )));
            }
            None => {}
        }

        let patch = ConversationPatch {
            assigned_agent_id: Some(Some(agent_id.to_string())),
            status: (chat.status == ChatStatus::Open).then_some(ChatStatus::InProgress),
            priority: None,
        };
        let guard = ConversationGuard::observed(&chat);
        match self.store.update_conversation_if(chat_id, &guard, &patch, now).await {
            Ok(updated) => {
                tracing::info!("Assigned chat {} to agent {}", chat_id, agent_id);
                Ok(Change {
                    chat: updated,
                    changed: true,
                })
            }
            Err(e) => {
                // A concurrent assign by the same agent counts as success.
                if let Ok(Some(current)) = self.store.find_conversation(chat_id).await {
                    if current.is_assigned_to(agent_id) {
                        return Ok(Change {
                            chat: current,
                            changed: false,
                        });
                    }
                }
                tracing::debug!("Assign of chat {} to {} lost a race: {}", chat_id, agent_id, e);
                Err(self.lost_race(chat_id, e).await)
            }
        }
    }

    pub async fn transfer(
        &self,
        chat_id: &str,
        from_agent_id: &str,
        to_agent_id: &str,
        reason: Option<String>,
        elevated: bool,
        now: DateTime<Utc>,
    ) -> Result<Transfer> {
        let chat = self.load(chat_id).await?;
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }

        let owner = match chat.assigned_agent_id.clone() {
            Some(owner) => owner,
            None if elevated => {
                return Err(Error::InvalidState(format!(
                    "chat {} is unassigned; assign it instead",
                    chat_id
                )));
            }
            None => {
                return Err(Error::Authorization(format!(
                    "chat {} is not assigned to you",
                    chat_id
                )));
            }
        };
        if owner != from_agent_id && !elevated {
            return Err(Error::Authorization(format!(
                "chat {} is not assigned to you",
                chat_id
            )));
        }

        if owner == to_agent_id {
            return Ok(Transfer {
                chat,
                from_agent_id: owner,
                to_agent_id: to_agent_id.to_string(),
                reason,
                at: now,
                changed: false,
            });
        }

        match self.store.find_agent(to_agent_id).await? {
            Some(target) if target.is_active => {}
            _ => return Err(Error::NotFound(format!("agent {}", to_agent_id))),
        }

        let patch = ConversationPatch {
            assigned_agent_id: Some(Some(to_agent_id.to_string())),
            ..Default::default()
        };
        let guard = ConversationGuard::observed(&chat);
        let updated = match self.store.update_conversation_if(chat_id, &guard, &patch, now).await {
            Ok(updated) => updated,
            Err(e) => return Err(self.lost_race(chat_id, e).await),
        };

        tracing::info!(
            "Transferred chat {} from {} to {} (by {})",
            chat_id,
            owner,
            to_agent_id,
            from_agent_id
        );
        Ok(Transfer {
            chat: updated,
            from_agent_id: owner,
            to_agent_id: to_agent_id.to_string(),
            reason,
            at: now,
            changed: true,
        })
    }

    pub async fn update_status(
        &self,
        chat_id: &str,
        agent_id: &str,
        status: ChatStatus,
        elevated: bool,
        now: DateTime<Utc>,
    ) -> Result<Change> {
        let chat = self.load(chat_id).await?;
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }
        if !chat.is_assigned_to(agent_id) && !elevated {
            return Err(Error::Authorization(format!(
                "chat {} is not assigned to you",
                chat_id
            )));
        }
        if chat.status == status {
            return Ok(Change { chat, changed: false });
        }
        if !status_transition_allowed(chat.status, status) {
            return Err(Error::InvalidState(format!(
                "chat {} cannot move from {} to {}",
                chat_id, chat.status, status
            )));
        }

        let patch = ConversationPatch {
            status: Some(status),
            ..Default::default()
        };
        let guard = ConversationGuard::observed(&chat);
        match self.store.update_conversation_if(chat_id, &guard, &patch, now).await {
            Ok(updated) => {
                tracing::info!("Chat {} status {} -> {}", chat_id, chat.status, status);
                Ok(Change {
                    chat: updated,
                    changed: true,
                })
            }
            Err(e) => Err(self.lost_race(chat_id, e).await),
        }
    }

    /// A customer reply hands a WAITING chat back to its agent. Any other
    /// status is left alone.
    pub async fn resume_on_reply(&self, chat: &Conversation, now: DateTime<Utc>) -> Result<Change> {
        if chat.status != ChatStatus::Waiting {
            return Ok(Change {
                chat: chat.clone(),
                changed: false,
            });
        }

        let patch = ConversationPatch {
            status: Some(ChatStatus::InProgress),
            ..Default::default()
        };
        let guard = ConversationGuard::observed(chat);
        match self.store.update_conversation_if(&chat.id, &guard, &patch, now).await {
            Ok(updated) => {
                tracing::info!("Chat {} resumed after customer reply", chat.id);
                Ok(Change {
                    chat: updated,
                    changed: true,
                })
            }
            Err(e) => Err(self.lost_race(&chat.id, e).await),
        }
    }

    pub async fn set_priority(
        &self,
        chat_id: &str,
        agent_id: &str,
        priority: Priority,
        elevated: bool,
        now: DateTime<Utc>,
    ) -> Result<Change> {
        let chat = self.load(chat_id).await?;
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }
        if !chat.is_assigned_to(agent_id) && !elevated {
            return Err(Error::Authorization(format!(
                "chat {} is not assigned to you",
                chat_id
            )));
        }
        if chat.priority == priority {
            return Ok(Change { chat, changed: false });
        }

        let patch = ConversationPatch {
            priority: Some(priority),
            ..Default::default()
        };
        let guard = ConversationGuard::observed(&chat);
        match self.store.update_conversation_if(chat_id, &guard, &patch, now).await {
            Ok(updated) => Ok(Change {
                chat: updated,
                changed: true,
            }),
            Err(e) => Err(self.lost_race(chat_id, e).await),
        }
    }

    /// Fold `from_customer_id` into `to_customer_id`: messages, conversations
    /// and sessions move, the duplicate record is deleted. All or nothing.
    pub async fn move_messages(&self, from_customer_id: &str, to_customer_id: &str) -> Result<MergeReport> {
        if from_customer_id == to_customer_id {
            return Err(Error::Validation(
                "cannot merge a customer into itself".to_string(),
            ));
        }
        let report = self
            .store
            .merge_customers(from_customer_id, to_customer_id)
            .await?;
        tracing::info!(
            "Merged customer {} into {}: {} messages, {} chats, {} sessions",
            from_customer_id,
            to_customer_id,
            report.messages_moved,
            report.conversations_moved,
            report.sessions_moved
        );
        Ok(report)
    }

    pub async fn find_duplicate_customers(&self) -> Result<Vec<Vec<Customer>>> {
        self.store.duplicate_customer_groups().await
    }

    /// Merge every duplicate group into its oldest record.
    pub async fn merge_duplicates(&self) -> Result<Vec<MergeOutcome>> {
        let mut outcomes = Vec::new();
        for group in self.find_duplicate_customers().await? {
            let Some((kept, rest)) = group.split_first() else {
                continue;
            };
            for duplicate in rest {
                let report = self.move_messages(&duplicate.id, &kept.id).await?;
                outcomes.push(MergeOutcome {
                    kept_customer_id: kept.id.clone(),
                    merged_customer_id: duplicate.id.clone(),
                    report,
                });
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Message, MessageType, Role, SenderType};
    use crate::store::SqliteStore;
    use crate::testing::{seed_agent, seed_chat, seed_customer};

    fn setup() -> (Arc<SqliteStore>, AssignmentManager) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let manager = AssignmentManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn test_assign_moves_open_to_in_progress() {
        let (store, manager) = setup();
        let now = Utc::now();
        let agent = seed_agent(store.as_ref(), "Ana", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;

        let change = manager.assign(&chat.id, &agent.id, now).await.unwrap();
        assert!(change.changed);
        assert_eq!(change.chat.status, ChatStatus::InProgress);
        assert!(change.chat.is_assigned_to(&agent.id));

        // Same agent again is an idempotent success.
        let again = manager.assign(&chat.id, &agent.id, now).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_assign_then_conflict() {
        let (store, manager) = setup();
        let now = Utc::now();
        let a1 = seed_agent(store.as_ref(), "A1", Role::agent()).await;
        let a2 = seed_agent(store.as_ref(), "A2", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;

        manager.assign(&chat.id, &a1.id, now).await.unwrap();
        let err = manager.assign(&chat.id, &a2.id, now).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let current = store.find_conversation(&chat.id).await.unwrap().unwrap();
        assert!(current.is_assigned_to(&a1.id));
    }

    #[tokio::test]
    async fn test_concurrent_assign_has_one_winner() {
        let (store, manager) = setup();
        let now = Utc::now();
        let a1 = seed_agent(store.as_ref(), "A1", Role::agent()).await;
        let a2 = seed_agent(store.as_ref(), "A2", Role::agent()).await;

        for _ in 0..10 {
            let chat = seed_chat(store.as_ref(), Priority::High, now).await;
            let (r1, r2) = tokio::join!(
                manager.assign(&chat.id, &a1.id, now),
                manager.assign(&chat.id, &a2.id, now)
            );
            let wins = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
            assert_eq!(wins, 1);
            let loser = if r1.is_ok() { r2 } else { r1 };
            assert!(matches!(loser, Err(Error::Conflict(_))));
        }
    }

    #[tokio::test]
    async fn test_assign_rejects_missing_and_closed() {
        let (store, manager) = setup();
        let now = Utc::now();
        let agent = seed_agent(store.as_ref(), "Ana", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Low, now).await;

        assert!(matches!(manager.assign("nope", &agent.id, now).await, Err(Error::NotFound(_))));
        assert!(matches!(manager.assign(&chat.id, "ghost", now).await, Err(Error::NotFound(_))));

        manager
            .update_status(&chat.id, &agent.id, ChatStatus::Closed, true, now)
            .await
            .unwrap();
        assert!(matches!(
            manager.assign(&chat.id, &agent.id, now).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_authorization() {
        let (store, manager) = setup();
        let now = Utc::now();
        let owner = seed_agent(store.as_ref(), "Owner", Role::agent()).await;
        let other = seed_agent(store.as_ref(), "Other", Role::agent()).await;
        let target = seed_agent(store.as_ref(), "Target", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;
        manager.assign(&chat.id, &owner.id, now).await.unwrap();

        let err = manager
            .transfer(&chat.id, &other.id, &target.id, None, false, now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        let unchanged = store.find_conversation(&chat.id).await.unwrap().unwrap();
        assert!(unchanged.is_assigned_to(&owner.id));

        // Elevated caller may move someone else's chat.
        let transfer = manager
            .transfer(&chat.id, &other.id, &target.id, Some("escalation".to_string()), true, now)
            .await
            .unwrap();
        assert!(transfer.changed);
        assert_eq!(transfer.from_agent_id, owner.id);
        assert!(transfer.chat.is_assigned_to(&target.id));
        assert_eq!(transfer.chat.status, ChatStatus::InProgress);
        assert_eq!(transfer.reason.as_deref(), Some("escalation"));
    }

    #[tokio::test]
    async fn test_transfer_edge_cases() {
        let (store, manager) = setup();
        let now = Utc::now();
        let owner = seed_agent(store.as_ref(), "Owner", Role::agent()).await;
        let mut disabled = seed_agent(store.as_ref(), "Disabled", Role::agent()).await;
        disabled.is_active = false;
        store.upsert_agent(&disabled).await.unwrap();

        let unassigned = seed_chat(store.as_ref(), Priority::Medium, now).await;
        assert!(matches!(
            manager.transfer(&unassigned.id, &owner.id, &disabled.id, None, true, now).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            manager.transfer(&unassigned.id, &owner.id, &disabled.id, None, false, now).await,
            Err(Error::Authorization(_))
        ));

        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;
        manager.assign(&chat.id, &owner.id, now).await.unwrap();

        let noop = manager
            .transfer(&chat.id, &owner.id, &owner.id, None, false, now)
            .await
            .unwrap();
        assert!(!noop.changed);

        assert!(matches!(
            manager.transfer(&chat.id, &owner.id, &disabled.id, None, false, now).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            manager.transfer(&chat.id, &owner.id, "ghost", None, false, now).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (store, manager) = setup();
        let now = Utc::now();
        let agent = seed_agent(store.as_ref(), "Ana", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;

        // OPEN -> WAITING is not a valid move.
        assert!(matches!(
            manager.update_status(&chat.id, &agent.id, ChatStatus::Waiting, true, now).await,
            Err(Error::InvalidState(_))
        ));

        manager.assign(&chat.id, &agent.id, now).await.unwrap();
        let later = now + Duration::minutes(3);
        let waiting = manager
            .update_status(&chat.id, &agent.id, ChatStatus::Waiting, false, later)
            .await
            .unwrap();
        assert_eq!(waiting.chat.status, ChatStatus::Waiting);
        assert_eq!(waiting.chat.status_changed_at.timestamp_millis(), later.timestamp_millis());

        let same = manager
            .update_status(&chat.id, &agent.id, ChatStatus::Waiting, false, later)
            .await
            .unwrap();
        assert!(!same.changed);

        manager
            .update_status(&chat.id, &agent.id, ChatStatus::Closed, false, later)
            .await
            .unwrap();
        assert!(matches!(
            manager.update_status(&chat.id, &agent.id, ChatStatus::InProgress, true, later).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            manager.set_priority(&chat.id, &agent.id, Priority::Urgent, true, later).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_non_owner_cannot_manage() {
        let (store, manager) = setup();
        let now = Utc::now();
        let owner = seed_agent(store.as_ref(), "Owner", Role::agent()).await;
        let other = seed_agent(store.as_ref(), "Other", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Low, now).await;
        manager.assign(&chat.id, &owner.id, now).await.unwrap();

        assert!(matches!(
            manager.set_priority(&chat.id, &other.id, Priority::High, false, now).await,
            Err(Error::Authorization(_))
        ));
        let change = manager
            .set_priority(&chat.id, &other.id, Priority::High, true, now)
            .await
            .unwrap();
        assert_eq!(change.chat.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_unassigned_listing_annotates_entries() {
        let (store, manager) = setup();
        let now = Utc::now();
        let agent = seed_agent(store.as_ref(), "Ana", Role::agent()).await;
        let waiting = seed_chat(store.as_ref(), Priority::Urgent, now - Duration::hours(2)).await;
        let taken = seed_chat(store.as_ref(), Priority::Urgent, now).await;
        manager.assign(&taken.id, &agent.id, now).await.unwrap();
        for _ in 0..3 {
            let msg = Message::new(&waiting.id, SenderType::Customer, Some(waiting.customer_id.as_str()), "hello?", MessageType::Text, now);
            store.append_message(&msg).await.unwrap();
        }

        let entries = manager
            .list_unassigned_chats(&ChatFilters::unassigned(), now)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].chat.id, waiting.id);
        assert_eq!(entries[0].priority_score, 126);
        assert_eq!(entries[0].waiting_time_formatted, "2h 0m");

        let mine = manager
            .list_agent_chats(&agent.id, &ChatFilters::assigned())
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, taken.id);
    }

    #[tokio::test]
    async fn test_merge_duplicates_keeps_oldest() {
        let (store, manager) = setup();
        let now = Utc::now();
        let oldest = seed_customer(store.as_ref(), "Ada", Some("ada@example.com"), now - Duration::days(3)).await;
        seed_customer(store.as_ref(), "Ada B", Some("ADA@example.com"), now - Duration::days(1)).await;
        seed_customer(store.as_ref(), "Ada C", Some("ada@example.com"), now).await;

        assert!(matches!(
            manager.move_messages(&oldest.id, &oldest.id).await,
            Err(Error::Validation(_))
        ));

        let outcomes = manager.merge_duplicates().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.kept_customer_id == oldest.id));
        assert!(manager.find_duplicate_customers().await.unwrap().is_empty());

        let json = serde_json::to_value(&outcomes[0]).unwrap();
        assert_eq!(json["kept_customer_id"], oldest.id.as_str());
        assert_eq!(json["report"]["messages_moved"], 0);
    }
}
