//! Run status board
//!
//! One overwritable `{state, message}` slot per run id. Pollers read the most
//! recent transition a run published; nothing is queued or kept as history.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Uploading,
    SchemaLoading,
    Synthesizing,
    Executing,
    Materializing,
    Diagnosing,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }

    /// Legal forward edges of the run state machine.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Uploading) => true,
            (Uploading, SchemaLoading) | (Uploading, Aborted) => true,
            (SchemaLoading, Synthesizing) | (SchemaLoading, Aborted) => true,
            (Synthesizing, Executing) | (Synthesizing, Diagnosing) => true,
            (Executing, Materializing) | (Executing, Diagnosing) => true,
            (Materializing, Done) | (Materializing, Diagnosing) => true,
            (Diagnosing, Done) | (Diagnosing, Aborted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Uploading => "uploading",
            RunState::SchemaLoading => "schema_loading",
            RunState::Synthesizing => "synthesizing",
            RunState::Executing => "executing",
            RunState::Materializing => "materializing",
            RunState::Diagnosing => "diagnosing",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub message: String,
}

impl RunStatus {
    pub fn idle() -> Self {
        Self {
            state: RunState::Idle,
            message: "Waiting for input".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    slots: DashMap<Uuid, RunStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the run's slot.
    pub fn publish(&self, run_id: Uuid, status: RunStatus) {
        self.slots.insert(run_id, status);
    }

    pub fn get(&self, run_id: &Uuid) -> Option<RunStatus> {
        self.slots.get(run_id).map(|entry| entry.value().clone())
    }

    /// Drop the slot once a poller has seen the terminal state.
    pub fn forget(&self, run_id: &Uuid) -> Option<RunStatus> {
        self.slots.remove(run_id).map(|(_, status)| status)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
