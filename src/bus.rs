//! In-process event bus.
//!
//! One tokio broadcast channel per topic, created lazily on first subscribe
//! and released when its last subscription is cancelled or dropped.
//! Publishing to a topic nobody listens to is a no-op.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

use crate::core::models::{ChatStatus, Priority, SenderType};

/// Default per-topic buffer.
pub const DEFAULT_CAPACITY: usize = 100;

/// Addressable event stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Presence for one conversation session.
    Session(String),
    /// Everything happening to one conversation.
    Chat(String),
    /// Changes to the unassigned pool.
    Queue,
    /// Ownership changes affecting one agent.
    Agent(String),
}

/// Typing signal as broadcast to viewers.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TypingEvent {
    pub session_id: String,
    pub chat_id: Option<String>,
    pub user_id: String,
    pub is_typing: bool,
    /// Persisted expiry, absent when the signal stops typing.
    pub expires_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingEvent {
    ChatAssigned {
        chat_id: String,
        agent_id: String,
    },
    ChatTransferred {
        chat_id: String,
        from_agent_id: String,
        to_agent_id: String,
        reason: Option<String>,
    },
    StatusChanged {
        chat_id: String,
        status: ChatStatus,
    },
    PriorityChanged {
        chat_id: String,
        priority: Priority,
    },
    MessageSent {
        chat_id: String,
        message_id: String,
        sender_type: SenderType,
    },
    MessagesRead {
        chat_id: String,
        reader_id: String,
        marked: usize,
        unread_count: i64,
    },
    Typing(TypingEvent),
}

type Channels = Mutex<HashMap<Topic, broadcast::Sender<RoutingEvent>>>;

impl RoutingEvent {
    /// Wire name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingEvent::ChatAssigned { .. } => "chat_assigned",
            RoutingEvent::ChatTransferred { .. } => "chat_transferred",
            RoutingEvent::StatusChanged { .. } => "status_changed",
            RoutingEvent::PriorityChanged { .. } => "priority_changed",
            RoutingEvent::MessageSent { .. } => "message_sent",
            RoutingEvent::MessagesRead { .. } => "messages_read",
            RoutingEvent::Typing(_) => "typing",
        }
    }
}

pub struct EventBus {
    capacity: usize,
    channels: Arc<Channels>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver `event` to current subscribers of `topic`. Returns how many
    /// subscribers received it.
    pub fn publish(&self, topic: &Topic, event: RoutingEvent) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = channels.get(topic) else {
            return 0;
        };
        match tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                // Every subscriber is gone; release the channel.
                channels.remove(topic);
                0
            }
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let rx = channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        tracing::debug!("Subscribed to {:?}", topic);
        Subscription {
            topic,
            inner: Some(BroadcastStream::new(rx)),
            channels: Arc::downgrade(&self.channels),
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels.get(topic).map_or(0, |tx| tx.receiver_count())
    }

    /// Topics that currently hold a channel.
    pub fn topic_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Live event stream for one topic. Ends after `cancel()`; dropping it
/// releases the underlying receiver.
pub struct Subscription {
    topic: Topic,
    inner: Option<BroadcastStream<RoutingEvent>>,
    channels: Weak<Channels>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn cancel(&mut self) {
        if self.release() {
            tracing::debug!("Cancelled subscription to {:?}", self.topic);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_none()
    }

    /// Drop the receiver and remove the topic's channel if it was the last one.
    fn release(&mut self) -> bool {
        let Some(inner) = self.inner.take() else {
            return false;
        };
        drop(inner);

        if let Some(channels) = self.channels.upgrade() {
            let mut channels = channels.lock().unwrap_or_else(|p| p.into_inner());
            if channels
                .get(&self.topic)
                .is_some_and(|tx| tx.receiver_count() == 0)
            {
                channels.remove(&self.topic);
            }
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl Stream for Subscription {
    type Item = RoutingEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match Pin::new(inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!("Subscriber on {:?} lagged, skipped {} events", this.topic, skipped);
                }
                Poll::Ready(None) => {
                    this.release();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn assigned(chat: &str) -> RoutingEvent {
        RoutingEvent::ChatAssigned {
            chat_id: chat.to_string(),
            agent_id: "a1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(&Topic::Queue, assigned("c1")), 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new(8);
        let mut chat = bus.subscribe(Topic::Chat("c1".to_string()));
        let mut other = bus.subscribe(Topic::Chat("c2".to_string()));

        assert_eq!(bus.publish(&Topic::Chat("c1".to_string()), assigned("c1")), 1);

        let got = tokio::time::timeout(Duration::from_secs(1), chat.next()).await.unwrap();
        assert_eq!(got, Some(assigned("c1")));
        assert!(tokio::time::timeout(Duration::from_millis(50), other.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_releases_receiver() {
        let bus = EventBus::new(8);
        let topic = Topic::Session("s1".to_string());
        let mut sub = bus.subscribe(topic.clone());
        assert_eq!(bus.subscriber_count(&topic), 1);

        sub.cancel();
        assert!(sub.is_cancelled());
        assert_eq!(sub.next().await, None);
        assert_eq!(bus.subscriber_count(&topic), 0);
        assert_eq!(bus.publish(&topic, assigned("c1")), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_receiver() {
        let bus = EventBus::new(8);
        let topic = Topic::Agent("a1".to_string());
        {
            let _sub = bus.subscribe(topic.clone());
            assert_eq!(bus.subscriber_count(&topic), 1);
        }
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_cancelled_topics_are_released() {
        let bus = EventBus::new(8);
        for i in 0..1000 {
            let mut sub = bus.subscribe(Topic::Session(format!("s{}", i)));
            sub.cancel();
        }
        for i in 0..10 {
            let _sub = bus.subscribe(Topic::Chat(format!("c{}", i)));
        }
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topic_kept_while_other_subscribers_remain() {
        let bus = EventBus::new(8);
        let topic = Topic::Session("s1".to_string());
        let mut first = bus.subscribe(topic.clone());
        let mut second = bus.subscribe(topic.clone());

        first.cancel();
        assert_eq!(bus.topic_count(), 1);
        assert_eq!(bus.publish(&topic, assigned("c1")), 1);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), second.next()).await.unwrap(),
            Some(assigned("c1"))
        );

        drop(second);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(Topic::Queue);
        drop(bus);
        sub.cancel();
        assert!(sub.is_cancelled());
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(RoutingEvent::StatusChanged {
            chat_id: "c1".to_string(),
            status: ChatStatus::Waiting,
        })
        .unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(
            RoutingEvent::StatusChanged {
                chat_id: "c1".to_string(),
                status: ChatStatus::Waiting,
            }
            .kind(),
            "status_changed"
        );
        assert_eq!(json["status"], "WAITING");
    }
}
