//! Presence broadcaster: typing indicators.
//!
//! Indicators are persisted with a TTL so late joiners can reconcile, and
//! broadcast on the bus for live viewers. Viewers additionally expire each
//! signal on their own (`TypingView`) so a lost "stopped typing" event never
//! leaves an indicator stuck.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::models::TypingIndicator;
use crate::bus::{EventBus, RoutingEvent, Subscription, Topic, TypingEvent};
use crate::error::{Error, Result};
use crate::store::RecordStore;

pub const DEFAULT_TYPING_TTL_SECS: i64 = 10;
pub const DEFAULT_ADVISORY_WINDOW_SECS: i64 = 5;

pub struct PresenceBroadcaster {
    store: Arc<dyn RecordStore>,
    bus: Arc<EventBus>,
    ttl: Duration,
}

impl PresenceBroadcaster {
    pub fn new(store: Arc<dyn RecordStore>, bus: Arc<EventBus>, ttl: Duration) -> Self {
        Self { store, bus, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record and broadcast a typing signal. `false` removes the indicator
    /// immediately instead of waiting for the TTL.
    pub async fn signal_typing(
        &self,
        session_id: &str,
        chat_id: Option<&str>,
        user_id: &str,
        is_typing: bool,
        now: DateTime<Utc>,
    ) -> Result<TypingEvent> {
        if session_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(Error::Validation(
                "session id and user id are required".to_string(),
            ));
        }

        let event = if is_typing {
            let row = self
                .store
                .upsert_typing(session_id, chat_id, user_id, now, now + self.ttl)
                .await?;
            TypingEvent {
                session_id: row.session_id,
                chat_id: row.chat_id,
                user_id: row.user_id,
                is_typing: true,
                expires_at: Some(row.expires_at),
                at: now,
            }
        } else {
            self.store.delete_typing(session_id, user_id).await?;
            TypingEvent {
                session_id: session_id.to_string(),
                chat_id: chat_id.map(str::to_string),
                user_id: user_id.to_string(),
                is_typing: false,
                expires_at: None,
                at: now,
            }
        };

        self.publish(&event);
        Ok(event)
    }

    /// Fan out to the session topic and, when known, the chat topic.
    pub fn publish(&self, event: &TypingEvent) -> usize {
        let mut delivered = self.bus.publish(
            &Topic::Session(event.session_id.clone()),
            RoutingEvent::Typing(event.clone()),
        );
        if let Some(chat_id) = &event.chat_id {
            delivered += self
                .bus
                .publish(&Topic::Chat(chat_id.clone()), RoutingEvent::Typing(event.clone()));
        }
        delivered
    }

    /// Indicators still live at `now`, whether or not the sweeper has run.
    pub async fn active_typing(&self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<TypingIndicator>> {
        self.store.active_typing(session_id, now).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_expired_typing(now).await?;
        if removed > 0 {
            tracing::debug!("Swept {} expired typing indicators", removed);
        }
        Ok(removed)
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.bus.subscribe(Topic::Session(session_id.to_string()))
    }
}

/// Viewer-side typing state for one session.
///
/// Each entry lapses `window` after the signal that created it, without
/// waiting for the server.
#[derive(Debug, Clone)]
pub struct TypingView {
    window: Duration,
    expires: HashMap<String, DateTime<Utc>>,
}

impl Default for TypingView {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_ADVISORY_WINDOW_SECS))
    }
}

impl TypingView {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expires: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: &TypingEvent, now: DateTime<Utc>) {
        if event.is_typing {
            self.expires.insert(event.user_id.clone(), now + self.window);
        } else {
            self.expires.remove(&event.user_id);
        }
    }

    /// Apply a bus event; anything but typing is ignored.
    pub fn apply_event(&mut self, event: &RoutingEvent, now: DateTime<Utc>) {
        if let RoutingEvent::Typing(typing) = event {
            self.apply(typing, now);
        }
    }

    /// Replace local state with persisted rows, for viewers that just joined.
    pub fn reconcile(&mut self, rows: &[TypingIndicator], now: DateTime<Utc>) {
        self.expires = rows
            .iter()
            .filter(|row| row.is_active(now))
            .map(|row| (row.user_id.clone(), row.expires_at.min(now + self.window)))
            .collect();
    }

    pub fn is_typing(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.expires.get(user_id).is_some_and(|at| *at > now)
    }

    /// Users currently shown as typing, sorted.
    pub fn typing_users(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.expires.retain(|_, at| *at > now);
        let mut users: Vec<String> = self.expires.keys().cloned().collect();
        users.sort();
        users
    }
}
