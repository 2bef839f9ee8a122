//! Eligibility filtering and technician selection.
//!
//! Eligibility is the set of hard constraints (shift, skill, capacity) a
//! technician must satisfy to receive a task. Selection is the tie-breaking
//! rule among eligible technicians: least-loaded, greedy and local. There is
//! no look-ahead across pending tasks and no starvation prevention beyond the
//! load-based ordering — this is a local-decision scheduler, not a
//! bin-packing solver.
//!
//! The selection decision can be delegated to an external executable through
//! the same trait: JSON request on stdin, JSON response on stdout.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Priority, Task, Technician};

/// Narrow a technician set to those who may legally receive the task:
/// on shift, holding the required skill, below the capacity limit.
///
/// Pure function; an empty result is not an error — the caller decides.
/// Input order is preserved, which the selection tie-break relies on.
pub fn eligible<'a>(
    task: &Task,
    technicians: &'a [Technician],
    capacity: u32,
) -> Vec<&'a Technician> {
    technicians
        .iter()
        .filter(|t| {
            t.shift == crate::model::Shift::OnShift
                && t.skills.iter().any(|s| s == &task.required_skill)
                && t.active_tasks < capacity
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Decision wire contract
// ---------------------------------------------------------------------------

/// The slice of a task a selection policy may see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTask {
    pub required_skill: String,
    pub priority: Priority,
}

/// The slice of a technician a selection policy may see. Ids are plain
/// strings on this boundary so external deciders are not bound to our id
/// scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub skills: Vec<String>,
    pub active_tasks: u32,
}

impl Candidate {
    pub fn from_technician(tech: &Technician) -> Self {
        Self {
            id: tech.id.0.to_string(),
            skills: tech.skills.clone(),
            active_tasks: tech.active_tasks,
        }
    }
}

/// Full request handed to a decision function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub task: DecisionTask,
    pub technicians: Vec<Candidate>,
}

/// What a decision function answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub assigned_to: Option<String>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// Pluggable strategy for picking exactly one technician from an eligible,
/// non-empty candidate set. Returns the chosen candidate's id.
pub trait SelectionPolicy: Send {
    fn select(&self, task: &DecisionTask, candidates: &[Candidate]) -> Result<String>;
}

/// Default in-process policy: minimum `active_tasks`, ties broken by stable
/// input order (first encountered).
pub struct LeastLoaded;

impl SelectionPolicy for LeastLoaded {
    fn select(&self, task: &DecisionTask, candidates: &[Candidate]) -> Result<String> {
        least_loaded(candidates, task.priority)
            .map(|c| c.id.clone())
            .ok_or(Error::NoEligibleTechnician)
    }
}

fn least_loaded(candidates: &[Candidate], priority: Priority) -> Option<&Candidate> {
    if priority == Priority::Emergency {
        // Explicit re-sort step so Emergency-specific tie-breaks (e.g. skill
        // specialization) can slot in here without touching the Routine and
        // Urgent paths. The stable sort preserves input order among ties.
        let mut order: Vec<&Candidate> = candidates.iter().collect();
        order.sort_by_key(|c| c.active_tasks);
        return order.first().copied();
    }

    // First-encountered wins among equally loaded candidates.
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        match best {
            Some(b) if candidate.active_tasks >= b.active_tasks => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Answer a decision request with the in-process least-loaded rule. This is
/// the body of the standalone decision executable.
pub fn decide(request: &DecisionRequest) -> DecisionResponse {
    match least_loaded(&request.technicians, request.task.priority) {
        Some(candidate) => DecisionResponse {
            assigned_to: Some(candidate.id.clone()),
            error: None,
        },
        None => DecisionResponse {
            assigned_to: None,
            error: Some("No eligible technician".to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// External decision function
// ---------------------------------------------------------------------------

/// Delegates selection to an external executable.
///
/// The call is synchronous: request JSON on the child's stdin, response JSON
/// on its stdout. Any spawn failure, non-zero exit, malformed output, or
/// error response fails the whole assignment.
pub struct ExternalProcess {
    command: PathBuf,
    args: Vec<String>,
}

impl ExternalProcess {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl SelectionPolicy for ExternalProcess {
    fn select(&self, task: &DecisionTask, candidates: &[Candidate]) -> Result<String> {
        let request = DecisionRequest {
            task: task.clone(),
            technicians: candidates.to_vec(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Error::Decision(format!("encode request: {e}")))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Decision(format!("spawn {}: {e}", self.command.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Decision("no stdin handle on child".to_string()))?;

        // Feed the request from its own thread: writing inline deadlocks
        // against a decider that emits output before draining stdin once
        // both pipe buffers fill. A child that answers without reading the
        // whole request closes the pipe early; that is not an error.
        let writer = std::thread::spawn(move || match stdin.write_all(&payload) {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
            _ => Ok(()),
        });

        let output = child
            .wait_with_output()
            .map_err(|e| Error::Decision(format!("wait for decider: {e}")))?;

        writer
            .join()
            .map_err(|_| Error::Decision("request writer panicked".to_string()))?
            .map_err(|e| Error::Decision(format!("write request: {e}")))?;

        if !output.status.success() {
            return Err(Error::Decision(format!(
                "decider exited with {}",
                output.status
            )));
        }

        let response: DecisionResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Decision(format!("malformed response: {e}")))?;

        if let Some(reason) = response.error {
            return Err(Error::Decision(reason));
        }

        response
            .assigned_to
            .ok_or_else(|| Error::Decision("response missing assigned_to".to_string()))
    }
}
