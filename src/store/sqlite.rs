//! SQLite-backed record store.
//!
//! Timestamps are stored as unix milliseconds. Conditional updates are plain
//! `UPDATE ... WHERE` statements over the expected assignee and status, so
//! concurrent engine instances sharing one database file still get exactly
//! one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::models::{
    Agent, AgentStatus, AuditEntry, Conversation, ConversationSession, Customer, Message, Page,
    Permission, Role, SenderRef, SenderType, TypingIndicator,
};
use crate::error::{db, Error, Result};

use super::{
    Assignee, AssigneeGuard, ConversationGuard, ConversationPatch, ConversationQuery, MergeReport,
    RecordStore,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    status TEXT NOT NULL,
    role_name TEXT NOT NULL,
    permissions TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_active_at INTEGER,
    must_change_password INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    session_token TEXT NOT NULL UNIQUE,
    customer_id TEXT NOT NULL REFERENCES customers(id),
    ai_message_count INTEGER NOT NULL DEFAULT 0,
    human_message_count INTEGER NOT NULL DEFAULT 0,
    last_activity_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    source TEXT NOT NULL,
    customer_id TEXT NOT NULL REFERENCES customers(id),
    session_id TEXT REFERENCES sessions(id),
    assigned_agent_id TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_message_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    status_changed_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL REFERENCES conversations(id),
    content TEXT NOT NULL,
    sender_type TEXT NOT NULL,
    sender_id TEXT,
    message_type TEXT NOT NULL,
    is_from_ai INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,
    read_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS typing_indicators (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    chat_id TEXT,
    user_id TEXT NOT NULL,
    is_typing INTEGER NOT NULL,
    last_typing_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    UNIQUE (session_id, user_id)
);
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    chat_id TEXT,
    detail TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_assignee ON conversations(assigned_agent_id, status);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);
CREATE INDEX IF NOT EXISTS idx_typing_expiry ON typing_indicators(expires_at);
CREATE INDEX IF NOT EXISTS idx_audit_chat ON audit_log(chat_id, ts);
"#;

const CONVERSATION_COLUMNS: &str = "id, status, priority, source, customer_id, session_id, \
     assigned_agent_id, message_count, unread_count, last_message_at, created_at, updated_at, \
     status_changed_at, deleted";

const AGENT_COLUMNS: &str =
    "id, name, email, status, role_name, permissions, is_active, last_active_at, must_change_password";

const TYPING_COLUMNS: &str = "id, session_id, chat_id, user_id, is_typing, last_typing_at, expires_at";

/// Unread messages as seen by `?2`: everything unread except that viewer's own.
const RECOMPUTE_UNREAD: &str = "UPDATE conversations SET unread_count = (
        SELECT COUNT(*) FROM messages
        WHERE chat_id = ?1 AND is_read = 0
          AND NOT (sender_type = 'AGENT' AND sender_id = ?2)
    ) WHERE id = ?1";

/// SQLite record store. One connection, serialized behind an async mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db("open"))?;
        conn.busy_timeout(busy_timeout).map_err(db("busy timeout"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db("journal mode"))?;
        tracing::debug!("Opened record store at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and `--memory` runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db("foreign keys"))?;
        conn.execute_batch(SCHEMA).map_err(db("init"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_col<T: FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        status: parse_col(row, 1)?,
        priority: parse_col(row, 2)?,
        source: row.get(3)?,
        customer_id: row.get(4)?,
        session_id: row.get(5)?,
        assigned_agent_id: row.get(6)?,
        message_count: row.get(7)?,
        unread_count: row.get(8)?,
        last_message_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
        status_changed_at: from_millis(row.get(12)?),
        deleted: row.get(13)?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let status: AgentStatus = parse_col(row, 3)?;
    let permissions_json: String = row.get(5)?;
    let permissions: Vec<Permission> =
        serde_json::from_str(&permissions_json).map_err(|e| conversion_error(5, e))?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        status,
        role: Role {
            name: row.get(4)?,
            permissions,
        },
        is_active: row.get(6)?,
        last_active_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        must_change_password: row.get(8)?,
    })
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: from_millis(row.get(3)?),
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSession> {
    Ok(ConversationSession {
        id: row.get(0)?,
        session_token: row.get(1)?,
        customer_id: row.get(2)?,
        ai_message_count: row.get(3)?,
        human_message_count: row.get(4)?,
        last_activity_at: from_millis(row.get(5)?),
        created_at: from_millis(row.get(6)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender_type: SenderType = parse_col(row, 3)?;
    let sender_id: Option<String> = row.get(4)?;
    let sender_name: Option<String> = row.get(11)?;
    let user = match (&sender_id, sender_name) {
        (Some(id), Some(name)) => Some(SenderRef {
            id: id.clone(),
            name,
        }),
        _ => None,
    };
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        content: row.get(2)?,
        sender_type,
        sender_id,
        message_type: parse_col(row, 5)?,
        is_from_ai: row.get(6)?,
        is_read: row.get(7)?,
        delivered_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        read_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        created_at: from_millis(row.get(10)?),
        user,
    })
}

fn typing_from_row(row: &Row<'_>) -> rusqlite::Result<TypingIndicator> {
    Ok(TypingIndicator {
        id: row.get(0)?,
        session_id: row.get(1)?,
        chat_id: row.get(2)?,
        user_id: row.get(3)?,
        is_typing: row.get(4)?,
        last_typing_at: from_millis(row.get(5)?),
        expires_at: from_millis(row.get(6)?),
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let detail: String = row.get(5)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        ts: from_millis(row.get(1)?),
        actor_id: row.get(2)?,
        action: row.get(3)?,
        chat_id: row.get(4)?,
        detail: serde_json::from_str(&detail).map_err(|e| conversion_error(5, e))?,
    })
}

fn select_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversations WHERE id = ?1 AND deleted = 0",
            CONVERSATION_COLUMNS
        ),
        params![id],
        conversation_from_row,
    )
    .optional()
    .map_err(db("select conversation"))
}

fn customer_exists(conn: &Connection, id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM customers WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(db("count customer"))?;
    Ok(count > 0)
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_conversations_sync(conn: &Connection, query: &ConversationQuery) -> Result<Vec<Conversation>> {
    let mut sql = format!(
        "SELECT {} FROM conversations WHERE deleted = 0",
        CONVERSATION_COLUMNS
    );
    let mut values: Vec<Value> = Vec::new();

    match &query.assignee {
        Assignee::Agent(id) => {
            values.push(Value::Text(id.clone()));
            sql.push_str(&format!(" AND assigned_agent_id = ?{}", values.len()));
        }
        Assignee::Nobody => sql.push_str(" AND assigned_agent_id IS NULL"),
    }

    if !query.status.is_empty() {
        let start = values.len() + 1;
        values.extend(query.status.iter().map(|s| Value::Text(s.as_str().to_string())));
        sql.push_str(&format!(
            " AND status IN ({})",
            placeholders(start, query.status.len())
        ));
    }
    if let Some(priority) = query.priority {
        values.push(Value::Text(priority.as_str().to_string()));
        sql.push_str(&format!(" AND priority = ?{}", values.len()));
    }
    if let Some(source) = &query.source {
        values.push(Value::Text(source.clone()));
        sql.push_str(&format!(" AND source = ?{}", values.len()));
    }

    sql.push_str(
        " ORDER BY (last_message_at IS NULL), last_message_at DESC, created_at DESC, rowid DESC",
    );

    if let Some(page) = query.page {
        values.push(Value::Integer(page.limit as i64));
        values.push(Value::Integer(page.offset as i64));
        sql.push_str(&format!(
            " LIMIT ?{} OFFSET ?{}",
            values.len() - 1,
            values.len()
        ));
    }

    let mut stmt = conn.prepare(&sql).map_err(db("prepare conversations"))?;
    let rows = stmt
        .query_map(params_from_iter(values), conversation_from_row)
        .map_err(db("query conversations"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db("read conversations"))
}

fn update_conversation_if_sync(
    conn: &mut Connection,
    id: &str,
    guard: &ConversationGuard,
    patch: &ConversationPatch,
    now: DateTime<Utc>,
) -> Result<Conversation> {
    let tx = conn.transaction().map_err(db("begin"))?;

    let mut values: Vec<Value> = vec![Value::Integer(millis(now))];
    let mut sets = vec!["updated_at = ?1".to_string()];

    if let Some(assignee) = &patch.assigned_agent_id {
        values.push(match assignee {
            Some(agent_id) => Value::Text(agent_id.clone()),
            None => Value::Null,
        });
        sets.push(format!("assigned_agent_id = ?{}", values.len()));
    }
    if let Some(status) = patch.status {
        values.push(Value::Text(status.as_str().to_string()));
        sets.push(format!("status = ?{}", values.len()));
        sets.push("status_changed_at = ?1".to_string());
    }
    if let Some(priority) = patch.priority {
        values.push(Value::Text(priority.as_str().to_string()));
        sets.push(format!("priority = ?{}", values.len()));
    }

    values.push(Value::Text(id.to_string()));
    let mut sql = format!(
        "UPDATE conversations SET {} WHERE id = ?{} AND deleted = 0",
        sets.join(", "),
        values.len()
    );
    values.push(Value::Text(guard.status.as_str().to_string()));
    sql.push_str(&format!(" AND status = ?{}", values.len()));
    match &guard.assignee {
        AssigneeGuard::Unassigned => sql.push_str(" AND assigned_agent_id IS NULL"),
        AssigneeGuard::AssignedTo(agent_id) => {
            values.push(Value::Text(agent_id.clone()));
            sql.push_str(&format!(" AND assigned_agent_id = ?{}", values.len()));
        }
    }

    let changed = tx
        .execute(&sql, params_from_iter(values))
        .map_err(db("conditional update"))?;

    let current = select_conversation(&tx, id)?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;
    if changed == 0 {
        return Err(Error::Conflict(format!(
            "conversation {} changed concurrently (now {} / {}); re-fetch before retrying",
            id,
            current.status,
            current.assigned_agent_id.as_deref().unwrap_or("unassigned")
        )));
    }

    tx.commit().map_err(db("commit"))?;
    Ok(current)
}

fn append_message_sync(conn: &mut Connection, message: &Message) -> Result<Conversation> {
    let tx = conn.transaction().map_err(db("begin"))?;
    let created = millis(message.created_at);

    let touched = tx
        .execute(
            "UPDATE conversations SET message_count = message_count + 1, last_message_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted = 0",
            params![message.chat_id, created],
        )
        .map_err(db("touch conversation"))?;
    if touched == 0 {
        return Err(Error::NotFound(format!("conversation {}", message.chat_id)));
    }

    tx.execute(
        "INSERT INTO messages (id, chat_id, content, sender_type, sender_id, message_type, is_from_ai, is_read, delivered_at, read_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            message.id,
            message.chat_id,
            message.content,
            message.sender_type.as_str(),
            message.sender_id,
            message.message_type.as_str(),
            message.is_from_ai,
            message.is_read,
            message.delivered_at.map(millis),
            message.read_at.map(millis),
            created
        ],
    )
    .map_err(db("insert message"))?;

    let (ai, human) = match message.sender_type {
        SenderType::Ai => (1, 0),
        SenderType::Customer | SenderType::Agent => (0, 1),
        SenderType::System => (0, 0),
    };
    tx.execute(
        "UPDATE sessions SET ai_message_count = ai_message_count + ?2,
                human_message_count = human_message_count + ?3,
                last_activity_at = ?4
         WHERE id = (SELECT session_id FROM conversations WHERE id = ?1)",
        params![message.chat_id, ai, human, created],
    )
    .map_err(db("touch session"))?;

    let owner: Option<String> = tx
        .query_row(
            "SELECT assigned_agent_id FROM conversations WHERE id = ?1",
            params![message.chat_id],
            |row| row.get(0),
        )
        .map_err(db("select owner"))?;
    tx.execute(RECOMPUTE_UNREAD, params![message.chat_id, owner])
        .map_err(db("recompute unread"))?;

    let conversation = select_conversation(&tx, &message.chat_id)?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", message.chat_id)))?;
    tx.commit().map_err(db("commit"))?;
    Ok(conversation)
}

fn mark_messages_read_sync(
    conn: &mut Connection,
    chat_id: &str,
    message_ids: &[String],
    reader_id: &str,
    now: DateTime<Utc>,
) -> Result<(usize, Conversation)> {
    let tx = conn.transaction().map_err(db("begin"))?;

    let mut marked = 0;
    if !message_ids.is_empty() {
        let mut values = vec![Value::Text(chat_id.to_string()), Value::Integer(millis(now))];
        values.extend(message_ids.iter().map(|id| Value::Text(id.clone())));
        let sql = format!(
            "UPDATE messages SET is_read = 1,
                    read_at = COALESCE(read_at, ?2),
                    delivered_at = COALESCE(delivered_at, ?2)
             WHERE chat_id = ?1 AND is_read = 0 AND id IN ({})",
            placeholders(3, message_ids.len())
        );
        marked = tx
            .execute(&sql, params_from_iter(values))
            .map_err(db("mark read"))?;
    }

    tx.execute(RECOMPUTE_UNREAD, params![chat_id, reader_id])
        .map_err(db("recompute unread"))?;

    let conversation = select_conversation(&tx, chat_id)?
        .ok_or_else(|| Error::NotFound(format!("conversation {}", chat_id)))?;
    tx.commit().map_err(db("commit"))?;
    Ok((marked, conversation))
}

fn merge_customers_sync(conn: &mut Connection, from: &str, to: &str) -> Result<MergeReport> {
    let tx = conn.transaction().map_err(db("begin"))?;

    for id in [from, to] {
        if !customer_exists(&tx, id)? {
            return Err(Error::NotFound(format!("customer {}", id)));
        }
    }

    let messages_moved = tx
        .execute(
            "UPDATE messages SET sender_id = ?2 WHERE sender_type = 'CUSTOMER' AND sender_id = ?1",
            params![from, to],
        )
        .map_err(db("move messages"))?;
    let conversations_moved = tx
        .execute(
            "UPDATE conversations SET customer_id = ?2 WHERE customer_id = ?1",
            params![from, to],
        )
        .map_err(db("move conversations"))?;
    let sessions_moved = tx
        .execute(
            "UPDATE sessions SET customer_id = ?2 WHERE customer_id = ?1",
            params![from, to],
        )
        .map_err(db("move sessions"))?;
    tx.execute("DELETE FROM customers WHERE id = ?1", params![from])
        .map_err(db("delete customer"))?;

    tx.commit().map_err(db("commit"))?;
    Ok(MergeReport {
        messages_moved,
        conversations_moved,
        sessions_moved,
    })
}

fn duplicate_customer_groups_sync(conn: &Connection) -> Result<Vec<Vec<Customer>>> {
    let mut keys_stmt = conn
        .prepare(
            "SELECT lower(email) AS k FROM customers
             WHERE email IS NOT NULL AND email != ''
             GROUP BY k HAVING COUNT(*) > 1 ORDER BY k",
        )
        .map_err(db("prepare duplicates"))?;
    let keys = keys_stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(db("query duplicates"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db("read duplicates"))?;

    let mut members_stmt = conn
        .prepare(
            "SELECT id, name, email, created_at FROM customers
             WHERE lower(email) = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .map_err(db("prepare duplicate members"))?;
    let mut groups = Vec::with_capacity(keys.len());
    for key in keys {
        let members = members_stmt
            .query_map(params![key], customer_from_row)
            .map_err(db("query duplicate members"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("read duplicate members"))?;
        groups.push(members);
    }
    Ok(groups)
}

fn upsert_typing_sync(
    conn: &Connection,
    session_id: &str,
    chat_id: Option<&str>,
    user_id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<TypingIndicator> {
    conn.execute(
        "INSERT INTO typing_indicators (id, session_id, chat_id, user_id, is_typing, last_typing_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
         ON CONFLICT(session_id, user_id) DO UPDATE SET
             is_typing = 1,
             last_typing_at = excluded.last_typing_at,
             expires_at = excluded.expires_at,
             chat_id = COALESCE(excluded.chat_id, typing_indicators.chat_id)",
        params![
            ulid::Ulid::new().to_string(),
            session_id,
            chat_id,
            user_id,
            millis(now),
            millis(expires_at)
        ],
    )
    .map_err(db("upsert typing"))?;

    conn.query_row(
        &format!(
            "SELECT {} FROM typing_indicators WHERE session_id = ?1 AND user_id = ?2",
            TYPING_COLUMNS
        ),
        params![session_id, user_id],
        typing_from_row,
    )
    .map_err(db("select typing"))
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_customer(&self, customer: &Customer) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO customers (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![customer.id, customer.name, customer.email, millis(customer.created_at)],
        )
        .map_err(db("insert customer"))?;
        Ok(())
    }

    async fn find_customer(&self, id: &str) -> Result<Option<Customer>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, email, created_at FROM customers WHERE id = ?1",
            params![id],
            customer_from_row,
        )
        .optional()
        .map_err(db("select customer"))
    }

    async fn duplicate_customer_groups(&self) -> Result<Vec<Vec<Customer>>> {
        let conn = self.conn.lock().await;
        duplicate_customer_groups_sync(&conn)
    }

    async fn merge_customers(&self, from: &str, to: &str) -> Result<MergeReport> {
        let mut conn = self.conn.lock().await;
        merge_customers_sync(&mut conn, from, to)
    }

    async fn insert_session(&self, session: &ConversationSession) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (id, session_token, customer_id, ai_message_count, human_message_count, last_activity_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.session_token,
                session.customer_id,
                session.ai_message_count,
                session.human_message_count,
                millis(session.last_activity_at),
                millis(session.created_at)
            ],
        )
        .map_err(db("insert session"))?;
        Ok(())
    }

    async fn find_session(&self, id: &str) -> Result<Option<ConversationSession>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, session_token, customer_id, ai_message_count, human_message_count, last_activity_at, created_at
             FROM sessions WHERE id = ?1",
            params![id],
            session_from_row,
        )
        .optional()
        .map_err(db("select session"))
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let permissions = serde_json::to_string(&agent.role.permissions)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agents (id, name, email, status, role_name, permissions, is_active, last_active_at, must_change_password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 status = excluded.status,
                 role_name = excluded.role_name,
                 permissions = excluded.permissions,
                 is_active = excluded.is_active,
                 must_change_password = excluded.must_change_password",
            params![
                agent.id,
                agent.name,
                agent.email,
                agent.status.as_str(),
                agent.role.name,
                permissions,
                agent.is_active,
                agent.last_active_at.map(millis),
                agent.must_change_password
            ],
        )
        .map_err(db("upsert agent"))?;
        Ok(())
    }

    async fn find_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            params![id],
            agent_from_row,
        )
        .optional()
        .map_err(db("select agent"))
    }

    async fn touch_agent(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agents SET last_active_at = ?2 WHERE id = ?1",
            params![id, millis(now)],
        )
        .map_err(db("touch agent"))?;
        Ok(())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO conversations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                CONVERSATION_COLUMNS
            ),
            params![
                conversation.id,
                conversation.status.as_str(),
                conversation.priority.as_str(),
                conversation.source,
                conversation.customer_id,
                conversation.session_id,
                conversation.assigned_agent_id,
                conversation.message_count,
                conversation.unread_count,
                conversation.last_message_at.map(millis),
                millis(conversation.created_at),
                millis(conversation.updated_at),
                millis(conversation.status_changed_at),
                conversation.deleted
            ],
        )
        .map_err(db("insert conversation"))?;
        Ok(())
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().await;
        select_conversation(&conn, id)
    }

    async fn list_conversations(&self, query: &ConversationQuery) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock().await;
        list_conversations_sync(&conn, query)
    }

    async fn update_conversation_if(
        &self,
        id: &str,
        guard: &ConversationGuard,
        patch: &ConversationPatch,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let mut conn = self.conn.lock().await;
        update_conversation_if_sync(&mut conn, id, guard, patch, now)
    }

    async fn append_message(&self, message: &Message) -> Result<Conversation> {
        let mut conn = self.conn.lock().await;
        append_message_sync(&mut conn, message)
    }

    async fn list_messages(&self, chat_id: &str, page: Page) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT m.id, m.chat_id, m.content, m.sender_type, m.sender_id, m.message_type,
                        m.is_from_ai, m.is_read, m.delivered_at, m.read_at, m.created_at,
                        COALESCE(a.name, c.name)
                 FROM messages m
                 LEFT JOIN agents a ON m.sender_type = 'AGENT' AND a.id = m.sender_id
                 LEFT JOIN customers c ON m.sender_type = 'CUSTOMER' AND c.id = m.sender_id
                 WHERE m.chat_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(db("prepare messages"))?;
        let rows = stmt
            .query_map(
                params![chat_id, page.limit as i64, page.offset as i64],
                message_from_row,
            )
            .map_err(db("query messages"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("read messages"))
    }

    async fn mark_messages_read(
        &self,
        chat_id: &str,
        message_ids: &[String],
        reader_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(usize, Conversation)> {
        let mut conn = self.conn.lock().await;
        mark_messages_read_sync(&mut conn, chat_id, message_ids, reader_id, now)
    }

    async fn upsert_typing(
        &self,
        session_id: &str,
        chat_id: Option<&str>,
        user_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<TypingIndicator> {
        let conn = self.conn.lock().await;
        upsert_typing_sync(&conn, session_id, chat_id, user_id, now, expires_at)
    }

    async fn delete_typing(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM typing_indicators WHERE session_id = ?1 AND user_id = ?2",
                params![session_id, user_id],
            )
            .map_err(db("delete typing"))?;
        Ok(removed > 0)
    }

    async fn active_typing(&self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<TypingIndicator>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM typing_indicators
                 WHERE session_id = ?1 AND is_typing = 1 AND expires_at > ?2
                 ORDER BY last_typing_at ASC",
                TYPING_COLUMNS
            ))
            .map_err(db("prepare typing"))?;
        let rows = stmt
            .query_map(params![session_id, millis(now)], typing_from_row)
            .map_err(db("query typing"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("read typing"))
    }

    async fn delete_expired_typing(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM typing_indicators WHERE expires_at <= ?1 OR is_typing = 0",
            params![millis(now)],
        )
        .map_err(db("sweep typing"))
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        let detail = serde_json::to_string(&entry.detail)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (id, ts, actor_id, action, chat_id, detail) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                millis(entry.ts),
                entry.actor_id,
                entry.action,
                entry.chat_id,
                detail
            ],
        )
        .map_err(db("insert audit"))?;
        Ok(())
    }

    async fn list_audit(&self, chat_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, ts, actor_id, action, chat_id, detail FROM audit_log
                 WHERE chat_id = ?1 ORDER BY ts ASC, rowid ASC",
            )
            .map_err(db("prepare audit"))?;
        let rows = stmt
            .query_map(params![chat_id], audit_from_row)
            .map_err(db("query audit"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("read audit"))
    }
}
