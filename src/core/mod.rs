//! Core module - assignment, delivery, presence and the routing facade.
//!
//! Components are leaves-first:
//! - Priority scoring (pure)
//! - Assignment manager (ownership and status)
//! - Delivery tracker (messages and read state)
//! - Presence broadcaster (typing indicators)
//! - Routing facade (authenticated entry point)

pub mod assignment;
pub mod clock;
pub mod delivery;
pub mod models;
pub mod presence;
pub mod routing;
pub mod scoring;

pub use assignment::{AssignmentManager, QueueEntry, Transfer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryTracker, ReadReceipt};
pub use presence::{PresenceBroadcaster, TypingView};
pub use routing::{ChatView, FacadeOptions, MessageView, RoutingFacade};
