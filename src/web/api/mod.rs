//! API endpoints module.

pub mod chats;
pub mod messages;
pub mod typing;

pub use chats::{assign_chat, list_chats, list_unassigned, set_priority, transfer_chat, update_status};
pub use messages::{list_messages, mark_read, send_message};
pub use typing::{active_typing, signal_typing, stream_typing};
