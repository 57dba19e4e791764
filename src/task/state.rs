//! Task lifecycle states and the legal transitions between them.

use serde::{Deserialize, Serialize};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not running; no volatile timer held.
    Inactive,
    /// Activation in progress — clocks being registered.
    Activating,
    /// Both clocks registered, ticks flowing.
    Active,
    /// Too many consecutive failures; volatile timer disposed.
    Quarantined,
}

impl TaskState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Inactive, Activating)
                | (Activating, Active)
                | (Activating, Inactive)
                | (Active, Inactive)
                | (Active, Quarantined)
                | (Quarantined, Activating)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Active)
    }

    pub fn is_quarantined(self) -> bool {
        matches!(self, TaskState::Quarantined)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Inactive => "inactive",
            TaskState::Activating => "activating",
            TaskState::Active => "active",
            TaskState::Quarantined => "quarantined",
        };
        write!(f, "{s}")
    }
}
