//! Core engine. The public API for creating, dispatching, and advancing tasks.
//!
//! The engine owns the store, the selection policy, and the clock. All state
//! transitions go through here, each inside one store transaction: the task,
//! its technician, and the audit entry become visible together or not at all.
//! A rejected operation leaves every record untouched and writes no audit
//! entry. Callers needing concurrent access share the engine behind a lock;
//! operations are short, bounded, and synchronous.

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::audit::{AuditAction, AuditEntry, SYSTEM_ACTOR};
use crate::error::{Error, Result};
use crate::model::*;
use crate::policy::{Candidate, DecisionTask, LeastLoaded, SelectionPolicy, eligible};
use crate::store::Storage;

/// Wall-clock source for transition timestamps. Injected so tests control
/// time; production uses [`SystemClock`].
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What a successful assignment reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub assigned_to: TechnicianId,
}

/// The dispatch engine. Owns all state and enforces all invariants.
pub struct Engine {
    storage: Storage,
    policy: Box<dyn SelectionPolicy>,
    clock: Box<dyn Clock>,
    /// Maximum concurrent active tasks per technician.
    pub capacity: u32,
}

impl Engine {
    /// Create an engine with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::in_memory()?,
            policy: Box::new(LeastLoaded),
            clock: Box::new(SystemClock),
            capacity: DEFAULT_CAPACITY,
        })
    }

    /// Create an engine backed by a file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            storage: Storage::open(path)?,
            policy: Box::new(LeastLoaded),
            clock: Box::new(SystemClock),
            capacity: DEFAULT_CAPACITY,
        })
    }

    /// Replace the selection policy.
    pub fn with_policy(mut self, policy: Box<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Register a new technician. Skills must be non-empty; the shift starts
    /// as OnShift and the load counter at zero.
    pub fn create_technician(
        &mut self,
        code_name: impl Into<String>,
        skills: Vec<String>,
    ) -> Result<Technician> {
        if skills.is_empty() {
            return Err(Error::InvalidInput(
                "technician requires at least one skill".to_string(),
            ));
        }

        let tech = Technician {
            id: TechnicianId::new(),
            code_name: code_name.into(),
            skills,
            shift: Shift::OnShift,
            active_tasks: 0,
        };

        let now = self.clock.now();
        self.storage.with_transaction(|ctx| {
            ctx.insert_technician(&tech)?;
            ctx.append_audit(
                now,
                &tech.id.0.to_string(),
                AuditAction::TechnicianCreated,
                SYSTEM_ACTOR,
            )?;
            Ok(())
        })?;

        info!(technician = %tech.id, code_name = %tech.code_name, "technician created");
        Ok(tech)
    }

    /// Submit a new task. Status starts at Pending.
    pub fn create_task(&mut self, new: NewTask) -> Result<Task> {
        let now = self.clock.now();
        let task = Task {
            id: TaskId::new(),
            task_type: new.task_type,
            required_skill: new.required_skill,
            priority: new.priority,
            status: Status::Pending,
            assigned_to: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            deadline: new.deadline,
            duration_seconds: None,
        };

        self.storage.with_transaction(|ctx| {
            ctx.insert_task(&task)?;
            ctx.append_audit(
                now,
                &task.id.0.to_string(),
                AuditAction::TaskCreated,
                SYSTEM_ACTOR,
            )?;
            Ok(())
        })?;

        info!(task = %task.id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Assign a pending task: filter the technician set down to the eligible
    /// subset, let the selection policy pick one, and commit the task update,
    /// the counter increment, and the audit entry as one unit.
    pub fn assign(&mut self, task_id: TaskId) -> Result<Assignment> {
        let now = self.clock.now();
        let capacity = self.capacity;
        let policy = self.policy.as_ref();

        let result = self.storage.with_transaction(|ctx| {
            let task = ctx.get_task(task_id)?;
            if task.status != Status::Pending {
                return Err(Error::InvalidTransition {
                    from: task.status,
                    to: Status::Assigned,
                });
            }

            let technicians = ctx.list_technicians()?;
            let pool = eligible(&task, &technicians, capacity);
            if pool.is_empty() {
                return Err(Error::NoEligibleTechnician);
            }

            let candidates: Vec<Candidate> =
                pool.into_iter().map(Candidate::from_technician).collect();
            let decision_task = DecisionTask {
                required_skill: task.required_skill.clone(),
                priority: task.priority,
            };

            let selected = policy.select(&decision_task, &candidates)?;
            if !candidates.iter().any(|c| c.id == selected) {
                return Err(Error::Decision(format!(
                    "selected id {selected} is not among the candidates"
                )));
            }
            let technician = TechnicianId(
                selected
                    .parse()
                    .map_err(|e| Error::Decision(format!("bad technician id {selected}: {e}")))?,
            );

            ctx.update_status(task_id, Status::Assigned)?;
            ctx.set_assignee(task_id, technician)?;

            let load = ctx.adjust_active_tasks(technician, 1)?;
            if load > capacity {
                return Err(Error::InternalConsistency(format!(
                    "technician {technician} over capacity after assignment ({load} > {capacity})"
                )));
            }

            ctx.append_audit(now, &task_id.0.to_string(), AuditAction::TaskAssigned, &selected)?;

            Ok(Assignment {
                task_id,
                assigned_to: technician,
            })
        });

        match &result {
            Ok(assignment) => {
                info!(task = %task_id, technician = %assignment.assigned_to, "task assigned");
            }
            Err(Error::InternalConsistency(msg)) => {
                error!(task = %task_id, "consistency violation during assign: {msg}");
            }
            Err(_) => {}
        }
        result
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin work on an assigned task. Only the assignee may start it.
    pub fn start(&mut self, task_id: TaskId, technician_id: TechnicianId) -> Result<()> {
        let now = self.clock.now();

        self.storage.with_transaction(|ctx| {
            let task = ctx.get_task(task_id)?;
            if task.status != Status::Assigned {
                return Err(Error::InvalidTransition {
                    from: task.status,
                    to: Status::InProgress,
                });
            }
            if task.assigned_to != Some(technician_id) {
                return Err(Error::NotAuthorized {
                    task: task_id,
                    technician: technician_id,
                });
            }

            ctx.update_status(task_id, Status::InProgress)?;
            ctx.set_started(task_id, now)?;
            ctx.append_audit(
                now,
                &task_id.0.to_string(),
                AuditAction::TaskStarted,
                &technician_id.0.to_string(),
            )?;
            Ok(())
        })?;

        info!(task = %task_id, technician = %technician_id, "task started");
        Ok(())
    }

    /// Finish an in-progress task. Only the assignee may complete it. The
    /// completion timestamp and derived duration are recorded and the
    /// technician's load counter is released in the same transaction.
    pub fn complete(&mut self, task_id: TaskId, technician_id: TechnicianId) -> Result<()> {
        let now = self.clock.now();

        let result = self.storage.with_transaction(|ctx| {
            let task = ctx.get_task(task_id)?;
            if task.status != Status::InProgress {
                return Err(Error::InvalidTransition {
                    from: task.status,
                    to: Status::Completed,
                });
            }
            if task.assigned_to != Some(technician_id) {
                return Err(Error::NotAuthorized {
                    task: task_id,
                    technician: technician_id,
                });
            }

            // InProgress implies started_at was stamped. A missing value is
            // corruption; refuse to fabricate a duration from it.
            let started_at = task.started_at.ok_or_else(|| {
                Error::InternalConsistency(format!(
                    "task {task_id} is in_progress but has no started_at"
                ))
            })?;
            let duration_seconds = (now - started_at).num_seconds();

            ctx.update_status(task_id, Status::Completed)?;
            ctx.set_completed(task_id, now, duration_seconds)?;
            ctx.adjust_active_tasks(technician_id, -1)?;
            ctx.append_audit(
                now,
                &task_id.0.to_string(),
                AuditAction::TaskCompleted,
                &technician_id.0.to_string(),
            )?;
            Ok(())
        });

        match &result {
            Ok(()) => info!(task = %task_id, technician = %technician_id, "task completed"),
            Err(Error::InternalConsistency(msg)) => {
                error!(task = %task_id, "consistency violation during complete: {msg}");
            }
            Err(_) => {}
        }
        result
    }

    // -----------------------------------------------------------------------
    // Shift
    // -----------------------------------------------------------------------

    /// Change a technician's shift. Unconditional: going Off does not
    /// unassign tasks the technician already holds.
    pub fn update_shift(&mut self, technician_id: TechnicianId, shift: Shift) -> Result<Technician> {
        let now = self.clock.now();

        let tech = self.storage.with_transaction(|ctx| {
            let mut tech = ctx.get_technician(technician_id)?;
            ctx.set_shift(technician_id, shift)?;
            tech.shift = shift;
            ctx.append_audit(
                now,
                &technician_id.0.to_string(),
                AuditAction::ShiftChanged(shift),
                SYSTEM_ACTOR,
            )?;
            Ok(tech)
        })?;

        info!(technician = %technician_id, %shift, "shift updated");
        Ok(tech)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        self.storage.get_task(id)
    }

    pub fn get_technician(&self, id: TechnicianId) -> Result<Technician> {
        self.storage.get_technician(id)
    }

    /// Snapshot of all tasks.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.storage.list_tasks()
    }

    /// Snapshot of tasks in a given status.
    pub fn list_tasks_by_status(&self, status: Status) -> Result<Vec<Task>> {
        self.storage.list_tasks_by_status(status)
    }

    /// Snapshot of all technicians.
    pub fn list_technicians(&self) -> Result<Vec<Technician>> {
        self.storage.list_technicians()
    }

    /// Audit entries after a sequence number, in append order.
    pub fn audit_since(&self, since_seq: u64) -> Result<Vec<AuditEntry>> {
        self.storage.audit_since(since_seq)
    }
}
