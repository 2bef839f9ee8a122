//! SQLite entity store.
//!
//! Single source of truth for all task and technician state plus the audit
//! trail. WAL mode for concurrent read access. All writes go through the
//! engine, which scopes them inside a transaction so that a task, its
//! technician, and the audit entry commit together or not at all.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::audit::{AuditAction, AuditEntry};
use crate::error::{Error, Result};
use crate::model::*;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// All methods delegate to the same SQL logic as `Storage`, but execute
/// against the transaction's connection. Either all operations commit
/// together or none do.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn insert_technician(&self, tech: &Technician) -> Result<()> {
        insert_technician_on(self.tx, tech)
    }

    pub fn get_technician(&self, id: TechnicianId) -> Result<Technician> {
        get_technician_on(self.tx, id)
    }

    pub fn list_technicians(&self) -> Result<Vec<Technician>> {
        list_technicians_on(self.tx)
    }

    pub fn set_shift(&self, id: TechnicianId, shift: Shift) -> Result<()> {
        set_shift_on(self.tx, id, shift)
    }

    pub fn adjust_active_tasks(&self, id: TechnicianId, delta: i32) -> Result<u32> {
        adjust_active_tasks_on(self.tx, id, delta)
    }

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        insert_task_on(self.tx, task)
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        get_task_on(self.tx, id)
    }

    pub fn update_status(&self, id: TaskId, new_status: Status) -> Result<Status> {
        update_status_on(self.tx, id, new_status)
    }

    pub fn set_assignee(&self, id: TaskId, tech: TechnicianId) -> Result<()> {
        set_assignee_on(self.tx, id, tech)
    }

    pub fn set_started(&self, id: TaskId, at: chrono::DateTime<Utc>) -> Result<()> {
        set_started_on(self.tx, id, at)
    }

    pub fn set_completed(
        &self,
        id: TaskId,
        at: chrono::DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<()> {
        set_completed_on(self.tx, id, at, duration_seconds)
    }

    pub fn append_audit(
        &self,
        at: chrono::DateTime<Utc>,
        entity_id: &str,
        action: AuditAction,
        performed_by: &str,
    ) -> Result<AuditEntry> {
        append_audit_on(self.tx, at, entity_id, action, performed_by)
    }
}

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS technicians (
                id              TEXT PRIMARY KEY,
                code_name       TEXT NOT NULL,
                skills          TEXT NOT NULL,
                shift           TEXT NOT NULL,
                active_tasks    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id                  TEXT PRIMARY KEY,
                task_type           TEXT NOT NULL,
                required_skill      TEXT NOT NULL,
                priority            TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'pending',
                assigned_to         TEXT REFERENCES technicians(id),
                created_at          TEXT NOT NULL,
                started_at          TEXT,
                completed_at        TEXT,
                deadline            TEXT,
                duration_seconds    INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_task_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_task_assignee ON tasks(assigned_to)
                WHERE assigned_to IS NOT NULL;

            CREATE TABLE IF NOT EXISTS audit (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp       TEXT NOT NULL,
                entity_id       TEXT NOT NULL,
                action          TEXT NOT NULL,
                performed_by    TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Technicians
    // -----------------------------------------------------------------------

    pub fn get_technician(&self, id: TechnicianId) -> Result<Technician> {
        get_technician_on(&self.conn, id)
    }

    /// All technicians, stable creation order (rowid).
    pub fn list_technicians(&self) -> Result<Vec<Technician>> {
        list_technicians_on(&self.conn)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        get_task_on(&self.conn, id)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")?;

        let rows = stmt
            .query_map([], |row| Ok(row_to_task(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        collect_parsed(rows)
    }

    pub fn list_tasks_by_status(&self, status: Status) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC")?;

        let rows = stmt
            .query_map(params![status.to_string()], |row| Ok(row_to_task(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        collect_parsed(rows)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Get audit entries after a sequence number, in append order.
    pub fn audit_since(&self, since_seq: u64) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, timestamp, entity_id, action, performed_by
             FROM audit WHERE seq > ?1 ORDER BY seq ASC",
        )?;

        let entries = stmt
            .query_map(params![since_seq as i64], |row| {
                Ok(AuditEntry {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: row
                        .get::<_, String>(1)?
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    entity_id: row.get(2)?,
                    action: AuditAction::parse(&row.get::<_, String>(3)?),
                    performed_by: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn insert_technician_on(conn: &Connection, tech: &Technician) -> Result<()> {
    conn.execute(
        "INSERT INTO technicians (id, code_name, skills, shift, active_tasks)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            tech.id.0.to_string(),
            tech.code_name,
            serde_json::to_string(&tech.skills).unwrap_or_default(),
            tech.shift.to_string(),
            tech.active_tasks,
        ],
    )?;
    Ok(())
}

fn get_technician_on(conn: &Connection, id: TechnicianId) -> Result<Technician> {
    let row = conn
        .query_row(
            "SELECT * FROM technicians WHERE id = ?1",
            params![id.0.to_string()],
            |row| Ok(row_to_technician(row)),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("technician {id}")))?;

    row.map_err(|e| Error::InternalConsistency(format!("bad technician row: {e}")))
}

fn list_technicians_on(conn: &Connection) -> Result<Vec<Technician>> {
    let mut stmt = conn.prepare("SELECT * FROM technicians ORDER BY rowid ASC")?;

    let rows = stmt
        .query_map([], |row| Ok(row_to_technician(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    collect_parsed(rows)
}

fn set_shift_on(conn: &Connection, id: TechnicianId, shift: Shift) -> Result<()> {
    let changed = conn.execute(
        "UPDATE technicians SET shift = ?1 WHERE id = ?2",
        params![shift.to_string(), id.0.to_string()],
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("technician {id}")));
    }
    Ok(())
}

/// Apply a delta to a technician's load counter, returning the new value.
/// A delta that would drive the counter negative is a consistency violation
/// and leaves the row untouched.
fn adjust_active_tasks_on(conn: &Connection, id: TechnicianId, delta: i32) -> Result<u32> {
    let current: i64 = conn
        .query_row(
            "SELECT active_tasks FROM technicians WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("technician {id}")))?;

    let new = current + i64::from(delta);
    if new < 0 {
        return Err(Error::InternalConsistency(format!(
            "active_tasks for technician {id} would go negative ({current} {delta:+})"
        )));
    }

    conn.execute(
        "UPDATE technicians SET active_tasks = ?1 WHERE id = ?2",
        params![new, id.0.to_string()],
    )?;

    Ok(new as u32)
}

fn insert_task_on(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (
            id, task_type, required_skill, priority, status, assigned_to,
            created_at, started_at, completed_at, deadline, duration_seconds
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            task.id.0.to_string(),
            task.task_type,
            task.required_skill,
            task.priority.to_string(),
            task.status.to_string(),
            task.assigned_to.map(|id| id.0.to_string()),
            task.created_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            task.deadline.map(|t| t.to_rfc3339()),
            task.duration_seconds,
        ],
    )?;
    Ok(())
}

fn get_task_on(conn: &Connection, id: TaskId) -> Result<Task> {
    let row = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![id.0.to_string()],
            |row| Ok(row_to_task(row)),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

    row.map_err(|e| Error::InternalConsistency(format!("bad task row: {e}")))
}

/// Update a task's status, validating the state machine. Returns the
/// previous status.
fn update_status_on(conn: &Connection, id: TaskId, new_status: Status) -> Result<Status> {
    let old_status = get_task_on(conn, id)?.status;

    if !old_status.can_transition_to(new_status) {
        return Err(Error::InvalidTransition {
            from: old_status,
            to: new_status,
        });
    }

    conn.execute(
        "UPDATE tasks SET status = ?1 WHERE id = ?2",
        params![new_status.to_string(), id.0.to_string()],
    )?;

    Ok(old_status)
}

fn set_assignee_on(conn: &Connection, id: TaskId, tech: TechnicianId) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET assigned_to = ?1 WHERE id = ?2",
        params![tech.0.to_string(), id.0.to_string()],
    )?;
    Ok(())
}

fn set_started_on(conn: &Connection, id: TaskId, at: chrono::DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET started_at = ?1 WHERE id = ?2",
        params![at.to_rfc3339(), id.0.to_string()],
    )?;
    Ok(())
}

fn set_completed_on(
    conn: &Connection,
    id: TaskId,
    at: chrono::DateTime<Utc>,
    duration_seconds: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET completed_at = ?1, duration_seconds = ?2 WHERE id = ?3",
        params![at.to_rfc3339(), duration_seconds, id.0.to_string()],
    )?;
    Ok(())
}

fn append_audit_on(
    conn: &Connection,
    at: chrono::DateTime<Utc>,
    entity_id: &str,
    action: AuditAction,
    performed_by: &str,
) -> Result<AuditEntry> {
    conn.execute(
        "INSERT INTO audit (timestamp, entity_id, action, performed_by)
         VALUES (?1, ?2, ?3, ?4)",
        params![at.to_rfc3339(), entity_id, action.to_string(), performed_by],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(AuditEntry {
        seq: seq as u64,
        timestamp: at,
        entity_id: entity_id.to_string(),
        action,
        performed_by: performed_by.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn collect_parsed<T>(rows: Vec<std::result::Result<T, String>>) -> Result<Vec<T>> {
    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| Error::InternalConsistency(format!("bad row: {e}")))?);
    }
    Ok(result)
}

fn row_to_technician(row: &rusqlite::Row) -> std::result::Result<Technician, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let skills_str: String = row.get(2).map_err(|e| e.to_string())?;
    let shift_str: String = row.get(3).map_err(|e| e.to_string())?;

    Ok(Technician {
        id: TechnicianId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        code_name: row.get(1).map_err(|e| e.to_string())?,
        skills: serde_json::from_str(&skills_str).map_err(|e| e.to_string())?,
        shift: shift_str.parse()?,
        active_tasks: row.get(4).map_err(|e| e.to_string())?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> std::result::Result<Task, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let priority_str: String = row.get(3).map_err(|e| e.to_string())?;
    let status_str: String = row.get(4).map_err(|e| e.to_string())?;
    let assignee_str: Option<String> = row.get(5).map_err(|e| e.to_string())?;
    let created_str: String = row.get(6).map_err(|e| e.to_string())?;
    let started_str: Option<String> = row.get(7).map_err(|e| e.to_string())?;
    let completed_str: Option<String> = row.get(8).map_err(|e| e.to_string())?;
    let deadline_str: Option<String> = row.get(9).map_err(|e| e.to_string())?;

    Ok(Task {
        id: TaskId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        task_type: row.get(1).map_err(|e| e.to_string())?,
        required_skill: row.get(2).map_err(|e| e.to_string())?,
        priority: priority_str.parse()?,
        status: status_str.parse()?,
        assigned_to: assignee_str
            .map(|s| s.parse().map(TechnicianId))
            .transpose()
            .map_err(|e: uuid::Error| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        started_at: started_str.and_then(|s| s.parse().ok()),
        completed_at: completed_str.and_then(|s| s.parse().ok()),
        deadline: deadline_str.and_then(|s| s.parse().ok()),
        duration_seconds: row.get(10).map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_technician() -> Technician {
        Technician {
            id: TechnicianId::new(),
            code_name: "T1".to_string(),
            skills: vec!["IV".to_string()],
            shift: Shift::OnShift,
            active_tasks: 0,
        }
    }

    #[test]
    fn technician_roundtrips_through_storage() {
        let storage = Storage::in_memory().unwrap();
        let tech = sample_technician();
        insert_technician_on(&storage.conn, &tech).unwrap();

        let loaded = storage.get_technician(tech.id).unwrap();
        assert_eq!(loaded.id, tech.id);
        assert_eq!(loaded.code_name, "T1");
        assert_eq!(loaded.skills, vec!["IV".to_string()]);
        assert_eq!(loaded.shift, Shift::OnShift);
        assert_eq!(loaded.active_tasks, 0);
    }

    #[test]
    fn missing_technician_is_not_found() {
        let storage = Storage::in_memory().unwrap();
        let result = storage.get_technician(TechnicianId::new());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn active_tasks_cannot_go_negative() {
        let storage = Storage::in_memory().unwrap();
        let tech = sample_technician();
        insert_technician_on(&storage.conn, &tech).unwrap();

        let result = adjust_active_tasks_on(&storage.conn, tech.id, -1);
        assert!(matches!(result, Err(Error::InternalConsistency(_))));

        // Counter untouched after the rejection
        assert_eq!(storage.get_technician(tech.id).unwrap().active_tasks, 0);
    }

    #[test]
    fn status_update_validates_transition() {
        let storage = Storage::in_memory().unwrap();
        let task = Task {
            id: TaskId::new(),
            task_type: "triage".to_string(),
            required_skill: "IV".to_string(),
            priority: Priority::Routine,
            status: Status::Pending,
            assigned_to: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deadline: None,
            duration_seconds: None,
        };
        insert_task_on(&storage.conn, &task).unwrap();

        let result = update_status_on(&storage.conn, task.id, Status::Completed);
        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: Status::Pending,
                to: Status::Completed,
            })
        ));

        let old = update_status_on(&storage.conn, task.id, Status::Assigned).unwrap();
        assert_eq!(old, Status::Pending);
        assert_eq!(storage.get_task(task.id).unwrap().status, Status::Assigned);
    }

    #[test]
    fn unrecognized_audit_action_survives_scan() {
        let storage = Storage::in_memory().unwrap();

        storage
            .conn
            .execute(
                "INSERT INTO audit (timestamp, entity_id, action, performed_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![Utc::now().to_rfc3339(), "x", "TASK_ESCALATED", "SYSTEM"],
            )
            .unwrap();

        let entries = storage.audit_since(0).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].action {
            AuditAction::Unknown(raw) => assert_eq!(raw, "TASK_ESCALATED"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
