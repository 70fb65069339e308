//! Action log
//!
//! Audit trail of remote modifications. Every attempt opens a record that is
//! committed on success, cancelled when the user skipped the file and rolled back
//! when the operation failed or was aborted. Records are emitted as `tracing`
//! events on the `oxidesync::actions` target.

use serde::Serialize;
use tracing::{debug, info, warn};

pub type ActionId = u64;

const TARGET: &str = "oxidesync::actions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    Upload,
    Download,
    Delete,
    Rename,
    Move,
    Copy,
    Mkdir,
    Link,
    Chmod,
    Touch,
    Call,
    Ls,
    Stat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionState {
    Open,
    Committed,
    Cancelled,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub path: String,
    pub target: Option<String>,
    pub state: ActionState,
    pub error: Option<String>,
    pub output: Vec<String>,
}

#[derive(Debug)]
pub struct ActionLog {
    enabled: bool,
    session_name: String,
    next_id: ActionId,
    entries: Vec<SessionAction>,
}

impl ActionLog {
    pub fn new(session_name: &str, enabled: bool) -> Self {
        Self {
            enabled,
            session_name: session_name.to_string(),
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Open a record, `None` when logging is off
    pub fn begin(&mut self, kind: ActionKind, path: &str, target: Option<&str>) -> Option<ActionId> {
        if !self.enabled {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(SessionAction {
            id,
            kind,
            path: path.to_string(),
            target: target.map(str::to_string),
            state: ActionState::Open,
            error: None,
            output: Vec::new(),
        });
        Some(id)
    }

    fn entry_mut(&mut self, id: Option<ActionId>) -> Option<&mut SessionAction> {
        let id = id?;
        self.entries.iter_mut().rev().find(|a| a.id == id)
    }

    /// Forget the error of a failed attempt before retrying
    pub fn restart(&mut self, id: Option<ActionId>) {
        if let Some(action) = self.entry_mut(id) {
            action.state = ActionState::Open;
            action.error = None;
            action.output.clear();
        }
    }

    pub fn add_output(&mut self, id: Option<ActionId>, lines: &[String]) {
        if let Some(action) = self.entry_mut(id) {
            action.output.extend_from_slice(lines);
        }
    }

    pub fn commit(&mut self, id: Option<ActionId>) {
        let session = self.session_name.clone();
        if let Some(action) = self.entry_mut(id) {
            action.state = ActionState::Committed;
            info!(
                target: TARGET,
                session = %session,
                kind = ?action.kind,
                path = %action.path,
                target_path = action.target.as_deref().unwrap_or(""),
                "committed"
            );
        }
    }

    pub fn cancel(&mut self, id: Option<ActionId>) {
        if let Some(action) = self.entry_mut(id) {
            action.state = ActionState::Cancelled;
            debug!(target: TARGET, kind = ?action.kind, path = %action.path, "cancelled");
        }
    }

    pub fn rollback(&mut self, id: Option<ActionId>, error: Option<&str>) {
        let session = self.session_name.clone();
        if let Some(action) = self.entry_mut(id) {
            action.state = ActionState::RolledBack;
            action.error = error.map(str::to_string);
            warn!(
                target: TARGET,
                session = %session,
                kind = ?action.kind,
                path = %action.path,
                error = error.unwrap_or(""),
                "rolled back"
            );
        }
    }

    pub fn entries(&self) -> &[SessionAction] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
