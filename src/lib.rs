//! Handoff library root.

pub mod bus;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod identity;
pub mod logging;
pub mod store;
pub mod sweeper;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{EventBus, RoutingEvent, Subscription, Topic, TypingEvent};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{AssignmentManager, DeliveryTracker, PresenceBroadcaster, RoutingFacade, TypingView};
pub use error::{Error, Result};
pub use identity::{AgentIdentity, IdentityGateway, JwtGateway};
pub use store::{RecordStore, SqliteStore};
pub use web::run_server;
