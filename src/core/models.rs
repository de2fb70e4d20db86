//! Records the engine routes: conversations, messages, agents, sessions and
//! typing indicators, plus the typed filters used to list them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::Error;

/// Conversation lifecycle status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    Open,
    InProgress,
    Waiting,
    Closed,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Open => "OPEN",
            ChatStatus::InProgress => "IN_PROGRESS",
            ChatStatus::Waiting => "WAITING",
            ChatStatus::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatStatus::Closed)
    }
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(ChatStatus::Open),
            "IN_PROGRESS" => Ok(ChatStatus::InProgress),
            "WAITING" => Ok(ChatStatus::Waiting),
            "CLOSED" => Ok(ChatStatus::Closed),
            other => Err(Error::Validation(format!("unknown status '{}'", other))),
        }
    }
}

/// Declared urgency tier, lowest first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(Error::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Who authored a message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderType {
    Customer,
    Agent,
    Ai,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Customer => "CUSTOMER",
            SenderType::Agent => "AGENT",
            SenderType::Ai => "AI",
            SenderType::System => "SYSTEM",
        }
    }
}

impl FromStr for SenderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CUSTOMER" => Ok(SenderType::Customer),
            "AGENT" => Ok(SenderType::Agent),
            "AI" => Ok(SenderType::Ai),
            "SYSTEM" => Ok(SenderType::System),
            other => Err(Error::Validation(format!("unknown sender type '{}'", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    /// Internal note, visible to agents only.
    Note,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Image => "IMAGE",
            MessageType::File => "FILE",
            MessageType::Note => "NOTE",
        }
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(MessageType::Text),
            "IMAGE" => Ok(MessageType::Image),
            "FILE" => Ok(MessageType::File),
            "NOTE" => Ok(MessageType::Note),
            other => Err(Error::Validation(format!("unknown message type '{}'", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
    Away,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "ONLINE",
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Away => "AWAY",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(AgentStatus::Online),
            "OFFLINE" => Ok(AgentStatus::Offline),
            "AWAY" => Ok(AgentStatus::Away),
            other => Err(Error::Validation(format!("unknown agent status '{}'", other))),
        }
    }
}

/// Supervisory capabilities granted through an agent's role.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Read and write any conversation, not only owned ones.
    #[serde(rename = "chats.view_all")]
    ViewAllChats,
    /// Transfer a conversation owned by someone else.
    #[serde(rename = "chats.transfer_any")]
    TransferAnyChat,
    /// Change status or priority of a conversation owned by someone else.
    #[serde(rename = "chats.manage")]
    ManageChats,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn agent() -> Self {
        Self {
            name: "agent".to_string(),
            permissions: Vec::new(),
        }
    }

    pub fn supervisor() -> Self {
        Self {
            name: "supervisor".to_string(),
            permissions: vec![
                Permission::ViewAllChats,
                Permission::TransferAnyChat,
                Permission::ManageChats,
            ],
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub email: String,
    pub status: AgentStatus,
    pub role: Role,
    /// Disabled accounts cannot authenticate or receive transfers.
    pub is_active: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub must_change_password: bool,
}

impl Agent {
    pub fn new(name: &str, email: &str, role: Role) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            status: AgentStatus::Offline,
            role,
            is_active: true,
            last_active_at: None,
            must_change_password: false,
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.role.has(permission)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(name: &str, email: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
            created_at: now,
        }
    }
}

/// A customer-facing channel instance (one widget session, for example).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConversationSession {
    pub id: String,
    pub session_token: String,
    pub customer_id: String,
    pub ai_message_count: i64,
    pub human_message_count: i64,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(customer_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            session_token: uuid::Uuid::new_v4().to_string(),
            customer_id: customer_id.to_string(),
            ai_message_count: 0,
            human_message_count: 0,
            last_activity_at: now,
            created_at: now,
        }
    }
}

/// A routable unit of support work.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub id: String,
    pub status: ChatStatus,
    pub priority: Priority,
    /// Channel of origin (widget, email, whatsapp, ...).
    pub source: String,
    pub customer_id: String,
    pub session_id: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current status was entered.
    pub status_changed_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub deleted: bool,
}

impl Conversation {
    pub fn new(customer_id: &str, source: &str, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            status: ChatStatus::Open,
            priority,
            source: source.to_string(),
            customer_id: customer_id.to_string(),
            session_id: None,
            assigned_agent_id: None,
            message_count: 0,
            unread_count: 0,
            last_message_at: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
            deleted: false,
        }
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn is_assigned_to(&self, agent_id: &str) -> bool {
        self.assigned_agent_id.as_deref() == Some(agent_id)
    }
}

/// Sender identity projection attached to messages on read.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SenderRef {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender_type: SenderType,
    /// Agent id or customer id, absent for AI and system messages.
    pub sender_id: Option<String>,
    pub message_type: MessageType,
    pub is_from_ai: bool,
    pub is_read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<SenderRef>,
}

impl Message {
    pub fn new(
        chat_id: &str,
        sender_type: SenderType,
        sender_id: Option<&str>,
        content: &str,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender_type,
            sender_id: sender_id.map(str::to_string),
            message_type,
            is_from_ai: sender_type == SenderType::Ai,
            is_read: false,
            delivered_at: None,
            read_at: None,
            created_at: now,
            user: None,
        }
    }
}

/// Ephemeral "is composing" signal, one row per (session, user).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TypingIndicator {
    pub id: String,
    pub session_id: String,
    pub chat_id: Option<String>,
    pub user_id: String,
    pub is_typing: bool,
    pub last_typing_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_typing && self.expires_at > now
    }
}

/// Append-only record of ownership changes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditEntry {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub actor_id: String,
    pub action: String,
    pub chat_id: Option<String>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(actor_id: &str, action: &str, chat_id: Option<&str>, detail: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            ts: now,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            chat_id: chat_id.map(str::to_string),
            detail,
        }
    }
}

/// Filters for conversation listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatFilters {
    pub status: BTreeSet<ChatStatus>,
    pub priority: Option<Priority>,
    pub source: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

pub const DEFAULT_LIMIT: u32 = 20;

impl ChatFilters {
    /// Defaults for an agent's own conversations: everything not closed.
    pub fn assigned() -> Self {
        Self {
            status: [ChatStatus::Open, ChatStatus::InProgress, ChatStatus::Waiting]
                .into_iter()
                .collect(),
            priority: None,
            source: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }

    /// Defaults for the unassigned queue: open conversations only.
    pub fn unassigned() -> Self {
        Self {
            status: [ChatStatus::Open].into_iter().collect(),
            ..Self::assigned()
        }
    }

    pub fn with_status(mut self, status: impl IntoIterator<Item = ChatStatus>) -> Self {
        self.status = status.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.status.is_empty() {
            return Err(Error::Validation("at least one status is required".to_string()));
        }
        if self.limit == 0 {
            return Err(Error::Validation("limit must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Parse a comma-separated status list such as `OPEN,WAITING`.
pub fn parse_status_list(raw: &str) -> Result<BTreeSet<ChatStatus>, Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ChatStatus::from_str)
        .collect()
}

/// Message page ordering as returned to the caller.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!("in_progress".parse::<ChatStatus>().unwrap(), ChatStatus::InProgress);
        assert!(matches!("archived".parse::<ChatStatus>(), Err(Error::Validation(_))));

        let set = parse_status_list("OPEN, waiting,,").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ChatStatus::Waiting));
        assert!(parse_status_list("OPEN,nope").is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::High < Priority::Urgent);
        assert_eq!(serde_json::to_string(&Priority::Urgent).unwrap(), "\"URGENT\"");
    }

    #[test]
    fn test_filter_defaults() {
        let mine = ChatFilters::assigned();
        assert_eq!(mine.status.len(), 3);
        assert!(!mine.status.contains(&ChatStatus::Closed));

        let queue = ChatFilters::unassigned();
        assert_eq!(queue.status.into_iter().collect::<Vec<_>>(), vec![ChatStatus::Open]);

        let empty = ChatFilters::assigned().with_status(Vec::new());
        assert!(empty.validate().is_err());
        assert!(ChatFilters::assigned().with_page(0, 0).validate().is_err());
    }

    #[test]
    fn test_role_permissions() {
        assert!(!Role::agent().has(Permission::TransferAnyChat));
        assert!(Role::supervisor().has(Permission::TransferAnyChat));
        let json = serde_json::to_string(&Role::supervisor()).unwrap();
        assert!(json.contains("chats.view_all"));
    }

    #[test]
    fn test_message_from_ai_flag() {
        let now = Utc::now();
        let ai = Message::new("c1", SenderType::Ai, None, "hi", MessageType::Text, now);
        assert!(ai.is_from_ai);
        let agent = Message::new("c1", SenderType::Agent, Some("a1"), "hi", MessageType::Text, now);
        assert!(!agent.is_from_ai);
    }
}
