//! Append-only event log with snapshot-backed resume.

pub mod store;
pub mod types;

pub use store::EventStore;
pub use types::{Event, EventType, PendingEvent, SessionState, SessionStatus};
