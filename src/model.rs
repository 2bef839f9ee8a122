//! Core data model.
//!
//! A task is a unit of work that needs doing. It has identity, a required
//! skill, priority, and lifecycle status. A technician is a worker with a
//! skill set, a shift flag, and a load counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum concurrent active tasks per technician.
pub const DEFAULT_CAPACITY: u32 = 3;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Newtype for technician IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TechnicianId(pub Uuid);

impl TechnicianId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TechnicianId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TechnicianId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Technician
// ---------------------------------------------------------------------------

/// A worker tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Technician {
    /// Unique identifier, assigned at creation.
    pub id: TechnicianId,

    /// Display name.
    pub code_name: String,

    /// Skill tags. Non-empty; a task's `required_skill` must match one of
    /// these for the technician to be eligible.
    pub skills: Vec<String>,

    /// Whether the technician is currently on shift.
    pub shift: Shift,

    /// Count of tasks currently assigned-but-not-completed. Maintained by
    /// the engine; equals the number of this technician's tasks in
    /// Assigned or InProgress.
    pub active_tasks: u32,
}

/// Shift status of a technician.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shift {
    OnShift,
    Off,
}

impl std::fmt::Display for Shift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Shift::OnShift => "OnShift",
            Shift::Off => "Off",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Shift {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "onshift" | "on_shift" | "on" => Ok(Shift::OnShift),
            "off" => Ok(Shift::Off),
            other => Err(format!("unknown shift: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, generated at creation.
    pub id: TaskId,

    /// What kind of work this is (e.g., "blood-draw", "calibration").
    /// Informational; eligibility is driven by `required_skill`.
    pub task_type: String,

    /// Skill a technician must hold to receive this task.
    pub required_skill: String,

    /// Priority. Immutable after creation.
    pub priority: Priority,

    /// Current lifecycle status.
    pub status: Status,

    /// Owning technician. None while Pending, set exactly once at
    /// assignment and never changed afterward.
    pub assigned_to: Option<TechnicianId>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Optional due time. Stored and reported, not used by eligibility.
    pub deadline: Option<DateTime<Utc>>,

    /// Derived at completion as `completed_at - started_at`.
    pub duration_seconds: Option<i64>,
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Routine,
    Urgent,
    Emergency,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Routine => "Routine",
            Priority::Urgent => "Urgent",
            Priority::Emergency => "Emergency",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "routine" => Ok(Priority::Routine),
            "urgent" => Ok(Priority::Urgent),
            "emergency" => Ok(Priority::Emergency),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. Strictly linear, terminal at Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, waiting for assignment.
    Pending,
    /// A technician owns it, work not yet begun.
    Assigned,
    /// The assigned technician is actively working.
    InProgress,
    /// Done. Terminal.
    Completed,
}

impl Status {
    /// Can transition from self to `to`? No skipping, no reversal.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Assigned) | (Assigned, InProgress) | (InProgress, Completed)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Assigned => "assigned",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "assigned" => Ok(Status::Assigned),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new tasks. The engine's public API for submitting work.
pub struct NewTask {
    pub(crate) task_type: String,
    pub(crate) required_skill: String,
    pub(crate) priority: Priority,
    pub(crate) deadline: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, required_skill: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            required_skill: required_skill.into(),
            priority: Priority::Routine,
            deadline: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
