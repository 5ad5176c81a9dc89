//! Durable per-session event log.
//!
//! Each session gets two files under the sessions directory: an
//! append-only JSONL log (`<id>.events.jsonl`) and an overwritable
//! snapshot (`<id>.state.json`). The log is never rewritten in place;
//! the snapshot is always derivable by folding the log and is never more
//! authoritative than it. All appends go through one `&mut self` owner,
//! which is the single-writer discipline the format requires.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::events::types::{Event, EventType, PendingEvent, SessionState};
use crate::{mlog, mlog_debug, mlog_warn};

pub struct EventStore {
    sessions_dir: PathBuf,
    state: SessionState,
    log: File,
}

fn log_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.events.jsonl", session_id))
}

fn snapshot_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.state.json", session_id))
}

impl EventStore {
    /// Create the store for a brand-new session. Refuses to clobber an
    /// existing session's log.
    pub fn create(sessions_dir: &Path, session_id: &str, prd_path: &str) -> Result<Self> {
        std::fs::create_dir_all(sessions_dir)?;
        let path = log_path(sessions_dir, session_id);
        if path.exists() {
            return Err(Error::SessionExists(session_id.to_string()));
        }
        let log = OpenOptions::new().create_new(true).append(true).open(&path)?;

        let mut store = Self {
            sessions_dir: sessions_dir.to_path_buf(),
            state: SessionState::new(session_id, prd_path),
            log,
        };
        store.emit(
            EventType::SessionStarted,
            json!({"prd_path": prd_path}),
            None,
            None,
        )?;
        mlog!("Session {} started (log at {})", session_id, path.display());
        Ok(store)
    }

    /// Re-open an existing session for continued appending.
    ///
    /// Loads the snapshot when present, otherwise folds the log. Emits a
    /// `SessionResumed` event and returns the store together with the set
    /// of task IDs the driver can skip.
    pub fn resume(sessions_dir: &Path, session_id: &str) -> Result<(Self, BTreeSet<TaskId>)> {
        let path = log_path(sessions_dir, session_id);
        if !path.exists() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let events = read_log(&path)?;
        let state = match read_snapshot(&snapshot_path(sessions_dir, session_id)) {
            Some(state) => state,
            None => {
                mlog_warn!("No usable snapshot for {}; folding the log", session_id);
                let prd_path = events
                    .first()
                    .and_then(|e| e.data.get("prd_path"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                SessionState::fold(session_id, &prd_path, &events)
            }
        };

        let log = OpenOptions::new().append(true).open(&path)?;
        let mut store = Self {
            sessions_dir: sessions_dir.to_path_buf(),
            state,
            log,
        };
        let completed = store.state.completed_task_ids.clone();
        store.emit(
            EventType::SessionResumed,
            json!({"completed_tasks": completed.len()}),
            None,
            None,
        )?;
        mlog!(
            "Session {} resumed: {} task(s) already completed",
            session_id,
            completed.len()
        );
        Ok((store, completed))
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Append one event, update the derived state, persist the snapshot.
    ///
    /// The append and the snapshot write must not interleave with another
    /// writer, which `&mut self` guarantees.
    pub fn emit(
        &mut self,
        event_type: EventType,
        data: Value,
        task_id: Option<TaskId>,
        agent: Option<String>,
    ) -> Result<Event> {
        let event = Event::new(event_type, &self.state.session_id, task_id, agent, data);

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        self.log.write_all(line.as_bytes())?;
        self.log.flush()?;

        self.state.apply(&event);
        self.write_snapshot()?;
        mlog_debug!("Event {} appended ({})", event.event_type, event.id);
        Ok(event)
    }

    /// Append an event produced by a parallel worker.
    pub fn emit_pending(&mut self, pending: PendingEvent) -> Result<Event> {
        self.emit(pending.event_type, pending.data, pending.task_id, pending.agent)
    }

    /// Named milestone event carrying the completed-task count.
    pub fn checkpoint(&mut self, description: &str) -> Result<Event> {
        let completed = self.state.completed_task_ids.len();
        self.emit(
            EventType::Checkpoint,
            json!({"description": description, "completed_tasks": completed}),
            None,
            None,
        )
    }

    /// Read a session's entire log back in write order.
    pub fn replay(sessions_dir: &Path, session_id: &str) -> Result<Vec<Event>> {
        let path = log_path(sessions_dir, session_id);
        if !path.exists() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        read_log(&path)
    }

    /// List session IDs present in the sessions directory.
    pub fn list_sessions(sessions_dir: &Path) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !sessions_dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(sessions_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".events.jsonl") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_snapshot(&self) -> Result<()> {
        let path = snapshot_path(&self.sessions_dir, &self.state.session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Parse the JSONL log. A torn final line (crash mid-append) is discarded
/// with a warning; a corrupt line anywhere else is a real error.
fn read_log(path: &Path) -> Result<Vec<Event>> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;

    let mut events = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            Err(e) if i == last => {
                mlog_warn!("Discarding torn final log line in {}: {}", path.display(), e);
            }
            Err(e) => return Err(Error::Json(e)),
        }
    }
    Ok(events)
}

fn read_snapshot(path: &Path) -> Option<SessionState> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            mlog_warn!("Snapshot {} unreadable ({}); will fold the log", path.display(), e);
            None
        }
    }
}
