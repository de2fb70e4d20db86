//! Routing facade: the authenticated, agent-facing entry point.
//!
//! Every call resolves the bearer credential to an active agent, then
//! delegates to the assignment manager, delivery tracker or presence
//! broadcaster. Ownership changes are audited and every state change is
//! published on the event bus.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;

use super::assignment::{AssignmentManager, Change, QueueEntry, Transfer};
use super::clock::Clock;
use super::delivery::{DeliveryTracker, ReadReceipt};
use super::models::{
    Agent, AuditEntry, ChatFilters, ChatStatus, Conversation, Message, MessageOrder, MessageType,
    Page, Permission, Priority, SenderType, TypingIndicator,
};
use super::presence::{
    PresenceBroadcaster, TypingView, DEFAULT_ADVISORY_WINDOW_SECS, DEFAULT_TYPING_TTL_SECS,
};
use crate::bus::{EventBus, RoutingEvent, Subscription, Topic, TypingEvent};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::identity::IdentityGateway;
use crate::store::RecordStore;

/// Conversation as seen by the calling agent.
#[derive(Serialize, Clone, Debug)]
pub struct ChatView {
    #[serde(flatten)]
    pub chat: Conversation,
    pub assigned_to_me: bool,
}

impl ChatView {
    fn new(chat: Conversation, agent: &Agent) -> Self {
        Self {
            assigned_to_me: chat.is_assigned_to(&agent.id),
            chat,
        }
    }
}

/// Message as seen by the calling agent.
#[derive(Serialize, Clone, Debug)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub is_current_user: bool,
}

impl MessageView {
    fn new(message: Message, agent: &Agent) -> Self {
        Self {
            is_current_user: message.sender_type == SenderType::Agent
                && message.sender_id.as_deref() == Some(agent.id.as_str()),
            message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FacadeOptions {
    pub typing_ttl: Duration,
    /// How long a viewer trusts a broadcast signal without a refresh.
    pub advisory_window: Duration,
    /// Upper bound applied to every requested page size.
    pub max_limit: u32,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::seconds(DEFAULT_TYPING_TTL_SECS),
            advisory_window: Duration::seconds(DEFAULT_ADVISORY_WINDOW_SECS),
            max_limit: 100,
        }
    }
}

impl FacadeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            typing_ttl: Duration::seconds(settings.presence.typing_ttl_secs as i64),
            advisory_window: Duration::seconds(settings.presence.advisory_window_secs as i64),
            max_limit: settings.queue.max_limit,
        }
    }
}

/// Highest score first, then longest waiting, then id.
pub fn rank_queue(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then(b.waiting_time.cmp(&a.waiting_time))
            .then(a.chat.id.cmp(&b.chat.id))
    });
}

pub struct RoutingFacade {
    identity: Arc<dyn IdentityGateway>,
    store: Arc<dyn RecordStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    assignments: AssignmentManager,
    delivery: DeliveryTracker,
    presence: PresenceBroadcaster,
    advisory_window: Duration,
    max_limit: u32,
}

impl RoutingFacade {
    pub fn new(
        store: Arc<dyn RecordStore>,
        identity: Arc<dyn IdentityGateway>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        options: FacadeOptions,
    ) -> Self {
        Self {
            assignments: AssignmentManager::new(store.clone()),
            delivery: DeliveryTracker::new(store.clone()),
            presence: PresenceBroadcaster::new(store.clone(), bus.clone(), options.typing_ttl),
            identity,
            store,
            bus,
            clock,
            advisory_window: options.advisory_window,
            max_limit: options.max_limit.max(1),
        }
    }

    pub fn assignments(&self) -> &AssignmentManager {
        &self.assignments
    }

    pub fn presence(&self) -> &PresenceBroadcaster {
        &self.presence
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Empty viewer-side typing state using the configured advisory window.
    pub fn typing_view(&self) -> TypingView {
        TypingView::new(self.advisory_window)
    }

    /// Resolve a credential to an active agent and record the activity.
    pub async fn authenticate(&self, credential: &str) -> Result<Agent> {
        let identity = self.identity.authenticate(credential).await?;
        let agent = match self.store.find_agent(&identity.agent_id).await? {
            Some(agent) if agent.is_active => agent,
            Some(_) => {
                return Err(Error::Authentication("agent account is disabled".to_string()));
            }
            None => return Err(Error::Authentication("unknown agent".to_string())),
        };

        if let Err(e) = self.store.touch_agent(&agent.id, self.clock.now()).await {
            tracing::warn!("Failed to record activity for agent {}: {}", agent.id, e);
        }
        Ok(agent)
    }

    async fn audit(&self, actor: &Agent, action: &str, chat_id: &str, detail: serde_json::Value) {
        let entry = AuditEntry::new(&actor.id, action, Some(chat_id), detail, self.clock.now());
        if let Err(e) = self.store.record_audit(&entry).await {
            tracing::error!("Failed to write audit entry {} for chat {}: {}", action, chat_id, e);
        }
    }

    fn publish(&self, topics: &[Topic], event: RoutingEvent) {
        for topic in topics {
            self.bus.publish(topic, event.clone());
        }
    }

    fn clamp(&self, mut filters: ChatFilters) -> ChatFilters {
        filters.limit = filters.limit.min(self.max_limit);
        filters
    }

    pub async fn list_my_chats(&self, credential: &str, filters: ChatFilters) -> Result<Vec<ChatView>> {
        let agent = self.authenticate(credential).await?;
        let filters = self.clamp(filters);
        let chats = self.assignments.list_agent_chats(&agent.id, &filters).await?;
        Ok(chats.into_iter().map(|chat| ChatView::new(chat, &agent)).collect())
    }

    /// Ranked unassigned queue. The page is cut after ranking so the
    /// highest-scoring conversations always come first.
    pub async fn list_unassigned_queue(&self, credential: &str, filters: ChatFilters) -> Result<Vec<QueueEntry>> {
        self.authenticate(credential).await?;
        let filters = self.clamp(filters);
        let mut entries = self
            .assignments
            .list_unassigned_chats(&filters, self.clock.now())
            .await?;
        rank_queue(&mut entries);
        Ok(entries
            .into_iter()
            .skip(filters.offset as usize)
            .take(filters.limit as usize)
            .collect())
    }

    pub async fn assign(&self, credential: &str, chat_id: &str) -> Result<ChatView> {
        let agent = self.authenticate(credential).await?;
        let Change { chat, changed } = self
            .assignments
            .assign(chat_id, &agent.id, self.clock.now())
            .await?;

        if changed {
            self.audit(&agent, "chat.assigned", chat_id, serde_json::json!({ "agent_id": agent.id }))
                .await;
            self.publish(
                &[
                    Topic::Chat(chat_id.to_string()),
                    Topic::Queue,
                    Topic::Agent(agent.id.clone()),
                ],
                RoutingEvent::ChatAssigned {
                    chat_id: chat_id.to_string(),
                    agent_id: agent.id.clone(),
                },
            );
        }
        Ok(ChatView::new(chat, &agent))
    }

    pub async fn transfer(
        &self,
        credential: &str,
        chat_id: &str,
        to_agent_id: &str,
        reason: Option<String>,
    ) -> Result<Transfer> {
        let agent = self.authenticate(credential).await?;
        let transfer = self
            .assignments
            .transfer(
                chat_id,
                &agent.id,
                to_agent_id,
                reason,
                agent.can(Permission::TransferAnyChat),
                self.clock.now(),
            )
            .await?;

        if transfer.changed {
            self.audit(
                &agent,
                "chat.transferred",
                chat_id,
                serde_json::json!({
                    "from_agent_id": transfer.from_agent_id,
                    "to_agent_id": transfer.to_agent_id,
                    "reason": transfer.reason,
                }),
            )
            .await;
            self.publish(
                &[
                    Topic::Chat(chat_id.to_string()),
                    Topic::Queue,
                    Topic::Agent(transfer.from_agent_id.clone()),
                    Topic::Agent(transfer.to_agent_id.clone()),
                ],
                RoutingEvent::ChatTransferred {
                    chat_id: chat_id.to_string(),
                    from_agent_id: transfer.from_agent_id.clone(),
                    to_agent_id: transfer.to_agent_id.clone(),
                    reason: transfer.reason.clone(),
                },
            );
        }
        Ok(transfer)
    }

    pub async fn update_status(&self, credential: &str, chat_id: &str, status: ChatStatus) -> Result<ChatView> {
        let agent = self.authenticate(credential).await?;
        let Change { chat, changed } = self
            .assignments
            .update_status(
                chat_id,
                &agent.id,
                status,
                agent.can(Permission::ManageChats),
                self.clock.now(),
            )
            .await?;

        if changed {
            self.audit(&agent, "chat.status_changed", chat_id, serde_json::json!({ "status": status }))
                .await;
            self.publish(
                &[Topic::Chat(chat_id.to_string()), Topic::Queue],
                RoutingEvent::StatusChanged {
                    chat_id: chat_id.to_string(),
                    status,
                },
            );
        }
        Ok(ChatView::new(chat, &agent))
    }

    pub async fn set_priority(&self, credential: &str, chat_id: &str, priority: Priority) -> Result<ChatView> {
        let agent = self.authenticate(credential).await?;
        let Change { chat, changed } = self
            .assignments
            .set_priority(
                chat_id,
                &agent.id,
                priority,
                agent.can(Permission::ManageChats),
                self.clock.now(),
            )
            .await?;

        if changed {
            self.audit(&agent, "chat.priority_changed", chat_id, serde_json::json!({ "priority": priority }))
                .await;
            self.publish(
                &[Topic::Chat(chat_id.to_string()), Topic::Queue],
                RoutingEvent::PriorityChanged {
                    chat_id: chat_id.to_string(),
                    priority,
                },
            );
        }
        Ok(ChatView::new(chat, &agent))
    }

    pub async fn get_messages(
        &self,
        credential: &str,
        chat_id: &str,
        page: Page,
        order: MessageOrder,
    ) -> Result<Vec<MessageView>> {
        let agent = self.authenticate(credential).await?;
        let page = Page {
            limit: page.limit.min(self.max_limit),
            offset: page.offset,
        };
        let messages = self.delivery.get_messages(chat_id, &agent, page, order).await?;
        Ok(messages
            .into_iter()
            .map(|message| MessageView::new(message, &agent))
            .collect())
    }

    pub async fn send_message(
        &self,
        credential: &str,
        chat_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<MessageView> {
        let agent = self.authenticate(credential).await?;
        let (message, _) = self
            .delivery
            .send_message(chat_id, &agent, content, message_type, self.clock.now())
            .await?;
        self.publish_message(&message);
        Ok(MessageView::new(message, &agent))
    }

    /// Channel ingress for customer, AI and system messages. Not agent
    /// authenticated; callers are trusted integrations.
    pub async fn record_inbound(
        &self,
        chat_id: &str,
        sender_type: SenderType,
        sender_id: Option<&str>,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let now = self.clock.now();
        let (message, chat) = self
            .delivery
            .record_inbound(chat_id, sender_type, sender_id, content, message_type, now)
            .await?;
        self.publish_message(&message);

        if sender_type == SenderType::Customer {
            match self.assignments.resume_on_reply(&chat, now).await {
                Ok(Change { changed: true, .. }) => self.publish(
                    &[Topic::Chat(chat_id.to_string()), Topic::Queue],
                    RoutingEvent::StatusChanged {
                        chat_id: chat_id.to_string(),
                        status: ChatStatus::InProgress,
                    },
                ),
                Ok(_) => {}
                // The message is stored either way.
                Err(e) => tracing::warn!("Failed to resume chat {} after reply: {}", chat_id, e),
            }
        }
        Ok(message)
    }

    fn publish_message(&self, message: &Message) {
        self.publish(
            &[Topic::Chat(message.chat_id.clone())],
            RoutingEvent::MessageSent {
                chat_id: message.chat_id.clone(),
                message_id: message.id.clone(),
                sender_type: message.sender_type,
            },
        );
    }

    pub async fn mark_read(&self, credential: &str, chat_id: &str, message_ids: &[String]) -> Result<ReadReceipt> {
        let agent = self.authenticate(credential).await?;
        let receipt = self
            .delivery
            .mark_read(chat_id, &agent, message_ids, self.clock.now())
            .await?;
        if receipt.marked > 0 {
            self.publish(
                &[Topic::Chat(chat_id.to_string())],
                RoutingEvent::MessagesRead {
                    chat_id: chat_id.to_string(),
                    reader_id: agent.id.clone(),
                    marked: receipt.marked,
                    unread_count: receipt.unread_count,
                },
            );
        }
        Ok(receipt)
    }

    async fn require_session(&self, session_id: &str) -> Result<()> {
        match self.store.find_session(session_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("session {}", session_id))),
        }
    }

    pub async fn signal_typing(
        &self,
        credential: &str,
        session_id: &str,
        is_typing: bool,
        chat_id: Option<&str>,
    ) -> Result<TypingEvent> {
        let agent = self.authenticate(credential).await?;
        self.require_session(session_id).await?;
        if let Some(chat_id) = chat_id {
            let chat = self
                .store
                .find_conversation(chat_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("chat {}", chat_id)))?;
            if chat.session_id.as_deref() != Some(session_id) {
                return Err(Error::Validation(format!(
                    "chat {} does not belong to session {}",
                    chat_id, session_id
                )));
            }
        }
        self.presence
            .signal_typing(session_id, chat_id, &agent.id, is_typing, self.clock.now())
            .await
    }

    pub async fn active_typing(&self, credential: &str, session_id: &str) -> Result<Vec<TypingIndicator>> {
        self.authenticate(credential).await?;
        self.presence.active_typing(session_id, self.clock.now()).await
    }

    pub async fn subscribe_typing(&self, credential: &str, session_id: &str) -> Result<Subscription> {
        self.authenticate(credential).await?;
        self.require_session(session_id).await?;
        Ok(self.presence.subscribe(session_id))
    }
}
