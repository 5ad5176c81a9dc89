pub mod config;
pub mod core;
pub mod council;
pub mod driver;
pub mod error;
pub mod events;
pub mod fixloop;
pub mod gates;
pub mod hooks;
pub mod log;
pub mod picker;
pub mod prompt;
pub mod verdict;
pub mod worker;

pub use config::Config;
pub use crate::core::{Task, TaskGraph, TaskId, TaskStatus};
pub use driver::{Driver, RunOutcome};
pub use error::{Error, Result};
pub use events::{EventStore, EventType};
