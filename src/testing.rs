//! Shared fixtures for unit tests.

use chrono::{DateTime, Utc};

use crate::core::models::{Agent, Conversation, ConversationSession, Customer, Priority, Role};
use crate::store::RecordStore;

pub async fn seed_customer(
    store: &dyn RecordStore,
    name: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Customer {
    let customer = Customer::new(name, email, now);
    store.insert_customer(&customer).await.unwrap();
    customer
}

/// Open widget conversation with its own customer and session, created at `at`.
pub async fn seed_chat(store: &dyn RecordStore, priority: Priority, at: DateTime<Utc>) -> Conversation {
    let customer = seed_customer(store, "Visitor", None, at).await;
    let session = ConversationSession::new(&customer.id, at);
    store.insert_session(&session).await.unwrap();
    let conversation = Conversation::new(&customer.id, "widget", priority, at).with_session(&session.id);
    store.insert_conversation(&conversation).await.unwrap();
    conversation
}

pub async fn seed_agent(store: &dyn RecordStore, name: &str, role: Role) -> Agent {
    let email = format!("{}@support.test", name.to_lowercase());
    let agent = Agent::new(name, &email, role);
    store.upsert_agent(&agent).await.unwrap();
    agent
}
