//! Session context
//!
//! Per-session conversational memory and the store that owns it.

mod session;
mod store;

pub use session::{Entity, EntityRecord, HistoryEntry, HistoryMetadata, Role, Session, Topic};
pub use store::SessionStore;
