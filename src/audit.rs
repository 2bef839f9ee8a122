//! Append-only audit trail of entity state changes.
//!
//! Every committed transition writes exactly one entry. Entries are never
//! mutated or deleted, and append order is the only ordering guarantee.
//! The trail exists for traceability; nothing in the engine reads it back
//! to make control decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Shift;

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
    /// Full id of the task or technician the action applies to.
    pub entity_id: String,
    /// What happened.
    pub action: AuditAction,
    /// Technician id responsible, or "SYSTEM" when not attributable.
    pub performed_by: String,
}

/// Actor recorded when no technician is responsible for a transition.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    TechnicianCreated,
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    ShiftChanged(Shift),
    /// An action string this build doesn't recognize. Preserved verbatim so
    /// older entries survive schema evolution.
    Unknown(String),
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::TechnicianCreated => write!(f, "TECHNICIAN_CREATED"),
            AuditAction::TaskCreated => write!(f, "TASK_CREATED"),
            AuditAction::TaskAssigned => write!(f, "TASK_ASSIGNED"),
            AuditAction::TaskStarted => write!(f, "TASK_STARTED"),
            AuditAction::TaskCompleted => write!(f, "TASK_COMPLETED"),
            AuditAction::ShiftChanged(shift) => write!(f, "SHIFT_CHANGED_TO_{shift}"),
            AuditAction::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

impl AuditAction {
    /// Parse a stored action string. Unrecognized strings come back as
    /// `Unknown` rather than failing the whole scan.
    pub fn parse(s: &str) -> Self {
        match s {
            "TECHNICIAN_CREATED" => AuditAction::TechnicianCreated,
            "TASK_CREATED" => AuditAction::TaskCreated,
            "TASK_ASSIGNED" => AuditAction::TaskAssigned,
            "TASK_STARTED" => AuditAction::TaskStarted,
            "TASK_COMPLETED" => AuditAction::TaskCompleted,
            other => match other.strip_prefix("SHIFT_CHANGED_TO_") {
                Some(value) => match value.parse::<Shift>() {
                    Ok(shift) => AuditAction::ShiftChanged(shift),
                    Err(_) => AuditAction::Unknown(other.to_string()),
                },
                None => AuditAction::Unknown(other.to_string()),
            },
        }
    }
}

impl serde::Serialize for AuditAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for AuditAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(AuditAction::parse(&s))
    }
}
