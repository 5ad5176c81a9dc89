//! Event records and the session state derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::core::TaskId;

/// Everything the orchestrator records about a run.
///
/// The set is closed: new behaviors get new variants, never free-form
/// strings, so replay consumers can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    SessionResumed,
    SessionCompleted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetry,
    LlmCallStarted,
    LlmCallCompleted,
    LlmCallFailed,
    GatePassed,
    GateFailed,
    HardLimitViolation,
    CouncilVerdict,
    OutputWritten,
    Checkpoint,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The serde name is the canonical spelling.
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One record in the append-only session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        session_id: &str,
        task_id: Option<TaskId>,
        agent: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            session_id: session_id.to_string(),
            task_id,
            agent,
            data,
        }
    }
}

/// An event produced inside a parallel worker, waiting to be appended by
/// the coordinating task. Carries everything but the session identity.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_type: EventType,
    pub task_id: Option<TaskId>,
    pub agent: Option<String>,
    pub data: Value,
}

impl PendingEvent {
    pub fn new(event_type: EventType, task_id: Option<TaskId>, data: Value) -> Self {
        Self {
            event_type,
            task_id,
            agent: None,
            data,
        }
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }
}

/// Lifecycle of a session as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Snapshot of a session, always derivable by folding its event log.
///
/// The log is the source of truth; the snapshot only saves refolding it
/// on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub prd_path: String,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub completed_task_ids: BTreeSet<TaskId>,
    pub failed_task_ids: BTreeSet<TaskId>,
    pub current_task_id: Option<TaskId>,
    pub total_events: u64,
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(session_id: &str, prd_path: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            prd_path: prd_path.to_string(),
            started_at: now,
            last_event_at: now,
            completed_task_ids: BTreeSet::new(),
            failed_task_ids: BTreeSet::new(),
            current_task_id: None,
            total_events: 0,
            status: SessionStatus::Active,
        }
    }

    /// Apply one event to the derived state.
    pub fn apply(&mut self, event: &Event) {
        self.total_events += 1;
        self.last_event_at = event.timestamp;

        match event.event_type {
            EventType::TaskStarted => {
                self.current_task_id = event.task_id.clone();
            }
            EventType::TaskCompleted => {
                if let Some(id) = &event.task_id {
                    self.completed_task_ids.insert(id.clone());
                    self.failed_task_ids.remove(id);
                }
                self.current_task_id = None;
            }
            EventType::TaskFailed => {
                if let Some(id) = &event.task_id {
                    self.failed_task_ids.insert(id.clone());
                }
                self.current_task_id = None;
            }
            EventType::SessionCompleted => {
                self.status = if self.failed_task_ids.is_empty() {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
            }
            EventType::SessionResumed => {
                self.status = SessionStatus::Active;
            }
            _ => {}
        }
    }

    /// Rebuild the state by folding a full log in write order.
    pub fn fold(session_id: &str, prd_path: &str, events: &[Event]) -> Self {
        let mut state = Self::new(session_id, prd_path);
        if let Some(first) = events.first() {
            state.started_at = first.timestamp;
        }
        for event in events {
            state.apply(event);
        }
        state
    }
}
