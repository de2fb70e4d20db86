//! Delivery tracker: message writes and read accounting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::models::{Agent, Conversation, Message, MessageOrder, MessageType, Page, Permission, SenderType};
use crate::error::{Error, Result};
use crate::store::RecordStore;

/// Outcome of a read receipt.
#[derive(Serialize, Clone, Debug)]
pub struct ReadReceipt {
    /// Messages newly marked by this call.
    pub marked: usize,
    pub unread_count: i64,
    pub chat: Conversation,
}

/// Trimmed content, or a validation error when nothing is left.
fn clean_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("message content is empty".to_string()));
    }
    Ok(trimmed)
}

pub struct DeliveryTracker {
    store: Arc<dyn RecordStore>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Load the chat and check `agent` may read and write it.
    async fn authorized_chat(&self, chat_id: &str, agent: &Agent) -> Result<Conversation> {
        let chat = self
            .store
            .find_conversation(chat_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
        if !chat.is_assigned_to(&agent.id) && !agent.can(Permission::ViewAllChats) {
            return Err(Error::Authorization(format!(
                "chat {} is not assigned to you",
                chat_id
            )));
        }
        Ok(chat)
    }

    /// A page counted from the newest message. `offset = 0` is the most
    /// recent `limit` messages.
    pub async fn get_messages(
        &self,
        chat_id: &str,
        agent: &Agent,
        page: Page,
        order: MessageOrder,
    ) -> Result<Vec<Message>> {
        if page.limit == 0 {
            return Err(Error::Validation("limit must be greater than zero".to_string()));
        }
        self.authorized_chat(chat_id, agent).await?;
        let mut messages = self.store.list_messages(chat_id, page).await?;
        if order == MessageOrder::OldestFirst {
            messages.reverse();
        }
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        agent: &Agent,
        content: &str,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> Result<(Message, Conversation)> {
        let content = clean_content(content)?;
        let chat = self.authorized_chat(chat_id, agent).await?;
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }

        let mut message = Message::new(chat_id, SenderType::Agent, Some(agent.id.as_str()), content, message_type, now);
        message.delivered_at = Some(now);
        let chat = self.store.append_message(&message).await?;
        tracing::debug!("Agent {} sent message {} in chat {}", agent.id, message.id, chat_id);
        Ok((message, chat))
    }

    /// Customer, AI or system message arriving from a channel.
    pub async fn record_inbound(
        &self,
        chat_id: &str,
        sender_type: SenderType,
        sender_id: Option<&str>,
        content: &str,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> Result<(Message, Conversation)> {
        let content = clean_content(content)?;
        if sender_type == SenderType::Agent {
            return Err(Error::Validation(
                "agent messages go through send_message".to_string(),
            ));
        }
        let chat = self
            .store
            .find_conversation(chat_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
        if chat.status.is_terminal() {
            return Err(Error::InvalidState(format!("chat {} is closed", chat_id)));
        }

        let message = Message::new(chat_id, sender_type, sender_id, content, message_type, now);
        let chat = self.store.append_message(&message).await?;
        tracing::debug!("Recorded inbound {} message {} in chat {}", sender_type.as_str(), message.id, chat_id);
        Ok((message, chat))
    }

    /// Mark the listed messages read. Ids that are unknown or belong to
    /// another chat are ignored; repeating the call changes nothing.
    pub async fn mark_read(
        &self,
        chat_id: &str,
        agent: &Agent,
        message_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        self.authorized_chat(chat_id, agent).await?;
        let (marked, chat) = self
            .store
            .mark_messages_read(chat_id, message_ids, &agent.id, now)
            .await?;
        Ok(ReadReceipt {
            marked,
            unread_count: chat.unread_count,
            chat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assignment::AssignmentManager;
    use crate::core::models::{Priority, Role};
    use crate::store::SqliteStore;
    use crate::testing::{seed_agent, seed_chat};
    use chrono::Duration;

    struct Fixture {
        store: Arc<SqliteStore>,
        tracker: DeliveryTracker,
        agent: Agent,
        chat: Conversation,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now();
        let agent = seed_agent(store.as_ref(), "Ana", Role::agent()).await;
        let chat = seed_chat(store.as_ref(), Priority::Medium, now).await;
        AssignmentManager::new(store.clone())
            .assign(&chat.id, &agent.id, now)
            .await
            .unwrap();
        Fixture {
            tracker: DeliveryTracker::new(store.clone()),
            store,
            agent,
            chat,
        }
    }

    #[tokio::test]
    async fn test_whitespace_message_is_rejected() {
        let f = fixture().await;
        let err = f
            .tracker
            .send_message(&f.chat.id, &f.agent, "  \n\t ", MessageType::Text, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let chat = f.store.find_conversation(&f.chat.id).await.unwrap().unwrap();
        assert_eq!(chat.message_count, 0);
        assert!(f.store.list_messages(&f.chat.id, Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_updates_counters() {
        let f = fixture().await;
        let now = Utc::now();
        let (message, chat) = f
            .tracker
            .send_message(&f.chat.id, &f.agent, "  Hi, how can I help?  ", MessageType::Text, now)
            .await
            .unwrap();

        assert_eq!(message.content, "Hi, how can I help?");
        assert_eq!(message.sender_type, SenderType::Agent);
        assert!(!message.is_from_ai);
        assert!(message.delivered_at.is_some());
        assert_eq!(chat.message_count, 1);
        assert_eq!(chat.last_message_at.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
        // The agent's own message is never unread for them.
        assert_eq!(chat.unread_count, 0);

        let session_id = f.chat.session_id.clone().unwrap();
        let session = f.store.find_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.human_message_count, 1);
        assert_eq!(session.ai_message_count, 0);
    }

    #[tokio::test]
    async fn test_inbound_counts_unread_and_session() {
        let f = fixture().await;
        let now = Utc::now();
        let customer = f.chat.customer_id.clone();
        f.tracker
            .record_inbound(&f.chat.id, SenderType::Customer, Some(customer.as_str()), "hello", MessageType::Text, now)
            .await
            .unwrap();
        let (_, chat) = f
            .tracker
            .record_inbound(&f.chat.id, SenderType::Ai, None, "An agent will be with you shortly", MessageType::Text, now)
            .await
            .unwrap();
        assert_eq!(chat.message_count, 2);
        assert_eq!(chat.unread_count, 2);

        let session = f
            .store
            .find_session(f.chat.session_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.human_message_count, 1);
        assert_eq!(session.ai_message_count, 1);

        assert!(matches!(
            f.tracker
                .record_inbound(&f.chat.id, SenderType::Agent, Some(f.agent.id.as_str()), "x", MessageType::Text, now)
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let f = fixture().await;
        let now = Utc::now();
        let customer = f.chat.customer_id.clone();
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let (msg, _) = f
                .tracker
                .record_inbound(&f.chat.id, SenderType::Customer, Some(customer.as_str()), text, MessageType::Text, now)
                .await
                .unwrap();
            ids.push(msg.id);
        }
        f.tracker
            .send_message(&f.chat.id, &f.agent, "reply", MessageType::Text, now)
            .await
            .unwrap();

        let mut to_mark = ids[..2].to_vec();
        to_mark.push("does-not-exist".to_string());

        let first = f.tracker.mark_read(&f.chat.id, &f.agent, &to_mark, now).await.unwrap();
        assert_eq!(first.marked, 2);
        assert_eq!(first.unread_count, 1);

        let second = f.tracker.mark_read(&f.chat.id, &f.agent, &to_mark, now).await.unwrap();
        assert_eq!(second.marked, 0);
        assert_eq!(second.unread_count, 1);

        let messages = f
            .tracker
            .get_messages(&f.chat.id, &f.agent, Page::default(), MessageOrder::OldestFirst)
            .await
            .unwrap();
        assert!(messages[0].is_read);
        assert!(messages[0].read_at.is_some());
        assert!(messages[0].delivered_at.is_some());
        assert!(!messages[2].is_read);
    }

    #[tokio::test]
    async fn test_page_is_taken_from_newest_end() {
        let f = fixture().await;
        let start = Utc::now();
        for i in 0..5 {
            f.tracker
                .send_message(&f.chat.id, &f.agent, &format!("m{}", i), MessageType::Text, start + Duration::seconds(i))
                .await
                .unwrap();
        }

        let page = Page { limit: 2, offset: 0 };
        let oldest_first = f
            .tracker
            .get_messages(&f.chat.id, &f.agent, page, MessageOrder::OldestFirst)
            .await
            .unwrap();
        let contents: Vec<&str> = oldest_first.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        let newest_first = f
            .tracker
            .get_messages(&f.chat.id, &f.agent, Page { limit: 2, offset: 2 }, MessageOrder::NewestFirst)
            .await
            .unwrap();
        let contents: Vec<&str> = newest_first.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m1"]);
        assert_eq!(newest_first[0].user.as_ref().map(|u| u.name.as_str()), Some("Ana"));
    }

    #[tokio::test]
    async fn test_access_requires_ownership_or_view_all() {
        let f = fixture().await;
        let now = Utc::now();
        let stranger = seed_agent(f.store.as_ref(), "Stranger", Role::agent()).await;
        let supervisor = seed_agent(f.store.as_ref(), "Sup", Role::supervisor()).await;

        assert!(matches!(
            f.tracker.get_messages(&f.chat.id, &stranger, Page::default(), MessageOrder::OldestFirst).await,
            Err(Error::Authorization(_))
        ));
        assert!(matches!(
            f.tracker.send_message(&f.chat.id, &stranger, "hi", MessageType::Text, now).await,
            Err(Error::Authorization(_))
        ));
        assert!(matches!(
            f.tracker.mark_read(&f.chat.id, &stranger, &[], now).await,
            Err(Error::Authorization(_))
        ));
        assert!(f
            .tracker
            .send_message(&f.chat.id, &supervisor, "stepping in", MessageType::Note, now)
            .await
            .is_ok());
        assert!(matches!(
            f.tracker.get_messages("missing", &f.agent, Page::default(), MessageOrder::OldestFirst).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_chat_rejects_messages() {
        let f = fixture().await;
        let now = Utc::now();
        AssignmentManager::new(f.store.clone())
            .update_status(&f.chat.id, &f.agent.id, crate::core::models::ChatStatus::Closed, false, now)
            .await
            .unwrap();
        assert!(matches!(
            f.tracker.send_message(&f.chat.id, &f.agent, "bye", MessageType::Text, now).await,
            Err(Error::InvalidState(_))
        ));
    }
}
