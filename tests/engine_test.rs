//! Integration tests for the dispatch engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

use dispatchq::audit::AuditAction;
use dispatchq::engine::{Clock, Engine};
use dispatchq::error::Error;
use dispatchq::model::*;

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn skills(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|s| s.to_string()).collect()
}

/// Settable clock shared between the test and the engine.
#[derive(Clone)]
struct TestClock(Arc<AtomicI64>);

impl TestClock {
    fn at(epoch_secs: i64) -> Self {
        Self(Arc::new(AtomicI64::new(epoch_secs)))
    }

    fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0.load(Ordering::SeqCst), 0).unwrap()
    }
}

/// Every technician's counter must equal the number of their tasks in
/// Assigned or InProgress.
fn assert_counters_consistent(engine: &Engine) {
    let tasks = engine.list_tasks().unwrap();
    for tech in engine.list_technicians().unwrap() {
        let expected = tasks
            .iter()
            .filter(|t| {
                t.assigned_to == Some(tech.id)
                    && matches!(t.status, Status::Assigned | Status::InProgress)
            })
            .count() as u32;
        assert_eq!(
            tech.active_tasks, expected,
            "counter drift for {}",
            tech.code_name
        );
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[test]
fn create_task_starts_pending_and_unassigned() {
    let mut engine = test_engine();

    let task = engine
        .create_task(NewTask::new("blood-draw", "IV").priority(Priority::Urgent))
        .unwrap();

    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.priority, Priority::Urgent);
    assert!(task.assigned_to.is_none());
    assert!(task.started_at.is_none());
    assert!(task.duration_seconds.is_none());
}

#[test]
fn create_technician_starts_on_shift_with_zero_load() {
    let mut engine = test_engine();

    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();

    assert_eq!(tech.shift, Shift::OnShift);
    assert_eq!(tech.active_tasks, 0);

    let listed = engine.list_technicians().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, tech.id);
}

#[test]
fn technician_requires_at_least_one_skill() {
    let mut engine = test_engine();

    let result = engine.create_technician("T1", vec![]);
    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert!(engine.list_technicians().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[test]
fn assign_selects_least_loaded_technician() {
    // Scenario A: T1 idle, T2 holding two tasks — assignment goes to T1.
    let mut engine = test_engine();
    let t1 = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let t2 = engine.create_technician("T2", skills(&["IV"])).unwrap();

    // Load T2 with two tasks while T1 is off shift.
    engine.update_shift(t1.id, Shift::Off).unwrap();
    for _ in 0..2 {
        let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
        let assignment = engine.assign(task.id).unwrap();
        assert_eq!(assignment.assigned_to, t2.id);
    }
    engine.update_shift(t1.id, Shift::OnShift).unwrap();

    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    let assignment = engine.assign(task.id).unwrap();

    assert_eq!(assignment.assigned_to, t1.id);
    assert_eq!(engine.get_technician(t1.id).unwrap().active_tasks, 1);
    assert_eq!(engine.get_technician(t2.id).unwrap().active_tasks, 2);

    let assigned = engine.get_task(task.id).unwrap();
    assert_eq!(assigned.status, Status::Assigned);
    assert_eq!(assigned.assigned_to, Some(t1.id));

    assert_counters_consistent(&engine);
}

#[test]
fn assign_with_no_matching_skill_fails_cleanly() {
    // Scenario B: nobody holds "Xray".
    let mut engine = test_engine();
    let t1 = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("imaging", "Xray")).unwrap();

    let result = engine.assign(task.id);
    assert!(matches!(result, Err(Error::NoEligibleTechnician)));

    // No state drift: task still pending, counter untouched.
    assert_eq!(engine.get_task(task.id).unwrap().status, Status::Pending);
    assert_eq!(engine.get_technician(t1.id).unwrap().active_tasks, 0);
}

#[test]
fn rejected_assign_is_idempotent() {
    let mut engine = test_engine();
    engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("imaging", "Xray")).unwrap();

    let audit_len = engine.audit_since(0).unwrap().len();

    for _ in 0..3 {
        let result = engine.assign(task.id);
        assert!(matches!(result, Err(Error::NoEligibleTechnician)));
    }

    assert_eq!(engine.get_task(task.id).unwrap().status, Status::Pending);
    // Rejected operations write no audit entries.
    assert_eq!(engine.audit_since(0).unwrap().len(), audit_len);
}

#[test]
fn assign_respects_capacity_limit() {
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();

    for _ in 0..3 {
        let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
        engine.assign(task.id).unwrap();
    }
    assert_eq!(engine.get_technician(tech.id).unwrap().active_tasks, 3);

    // Fourth assignment finds nobody under the limit.
    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    let result = engine.assign(task.id);
    assert!(matches!(result, Err(Error::NoEligibleTechnician)));
    assert_eq!(engine.get_technician(tech.id).unwrap().active_tasks, 3);

    assert_counters_consistent(&engine);
}

#[test]
fn assign_ignores_off_shift_technicians() {
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();
    engine.update_shift(tech.id, Shift::Off).unwrap();

    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    assert!(matches!(
        engine.assign(task.id),
        Err(Error::NoEligibleTechnician)
    ));
}

#[test]
fn assign_missing_task_is_not_found() {
    let mut engine = test_engine();
    let result = engine.assign(TaskId::new());
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn assign_twice_is_invalid_transition() {
    let mut engine = test_engine();
    engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();

    engine.assign(task.id).unwrap();
    let result = engine.assign(task.id);
    assert!(matches!(
        result,
        Err(Error::InvalidTransition {
            from: Status::Assigned,
            to: Status::Assigned,
        })
    ));
    assert_counters_consistent(&engine);
}

#[test]
fn emergency_assignment_still_picks_least_loaded() {
    let mut engine = test_engine();
    let t1 = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let t2 = engine.create_technician("T2", skills(&["IV"])).unwrap();

    engine.update_shift(t1.id, Shift::Off).unwrap();
    let filler = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    engine.assign(filler.id).unwrap();
    engine.update_shift(t1.id, Shift::OnShift).unwrap();

    let emergency = engine
        .create_task(NewTask::new("transfusion", "IV").priority(Priority::Emergency))
        .unwrap();
    let assignment = engine.assign(emergency.id).unwrap();

    assert_eq!(assignment.assigned_to, t1.id);
    assert_ne!(assignment.assigned_to, t2.id);
}

// ---------------------------------------------------------------------------
// Lifecycle: start and complete
// ---------------------------------------------------------------------------

#[test]
fn only_the_assignee_may_start() {
    // Scenario C.
    let mut engine = test_engine();
    let t1 = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let t2 = engine.create_technician("T2", skills(&["Xray"])).unwrap();

    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    let assignment = engine.assign(task.id).unwrap();
    assert_eq!(assignment.assigned_to, t1.id);

    let result = engine.start(task.id, t2.id);
    assert!(matches!(result, Err(Error::NotAuthorized { .. })));
    assert_eq!(engine.get_task(task.id).unwrap().status, Status::Assigned);

    engine.start(task.id, t1.id).unwrap();
    let started = engine.get_task(task.id).unwrap();
    assert_eq!(started.status, Status::InProgress);
    assert!(started.started_at.is_some());

    assert_counters_consistent(&engine);
}

#[test]
fn complete_computes_duration_and_releases_capacity() {
    // Scenario D: started at T0, completed at T0+90s.
    let clock = TestClock::at(1_700_000_000);
    let mut engine = test_engine().with_clock(Box::new(clock.clone()));

    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    engine.assign(task.id).unwrap();
    engine.start(task.id, tech.id).unwrap();

    clock.advance(90);
    engine.complete(task.id, tech.id).unwrap();

    let done = engine.get_task(task.id).unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.duration_seconds, Some(90));
    assert!(done.completed_at.is_some());
    assert_eq!(engine.get_technician(tech.id).unwrap().active_tasks, 0);

    assert_counters_consistent(&engine);
}

#[test]
fn only_the_assignee_may_complete() {
    let mut engine = test_engine();
    let t1 = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let t2 = engine.create_technician("T2", skills(&["IV", "Xray"])).unwrap();

    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    engine.assign(task.id).unwrap();
    engine.start(task.id, t1.id).unwrap();

    let result = engine.complete(task.id, t2.id);
    assert!(matches!(result, Err(Error::NotAuthorized { .. })));
    assert_eq!(engine.get_task(task.id).unwrap().status, Status::InProgress);
    assert_eq!(engine.get_technician(t1.id).unwrap().active_tasks, 1);
}

#[test]
fn lifecycle_cannot_skip_or_reverse() {
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();

    // Start before assignment
    assert!(matches!(
        engine.start(task.id, tech.id),
        Err(Error::InvalidTransition {
            from: Status::Pending,
            to: Status::InProgress,
        })
    ));

    engine.assign(task.id).unwrap();

    // Complete before start
    assert!(matches!(
        engine.complete(task.id, tech.id),
        Err(Error::InvalidTransition {
            from: Status::Assigned,
            to: Status::Completed,
        })
    ));

    engine.start(task.id, tech.id).unwrap();
    engine.complete(task.id, tech.id).unwrap();

    // Terminal: nothing moves a completed task.
    assert!(matches!(
        engine.start(task.id, tech.id),
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.complete(task.id, tech.id),
        Err(Error::InvalidTransition { .. })
    ));
}

#[test]
fn completed_capacity_frees_up_for_new_assignments() {
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
        engine.assign(task.id).unwrap();
        held.push(task.id);
    }

    let blocked = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    assert!(matches!(
        engine.assign(blocked.id),
        Err(Error::NoEligibleTechnician)
    ));

    engine.start(held[0], tech.id).unwrap();
    engine.complete(held[0], tech.id).unwrap();

    // Capacity released, the blocked task can now be placed.
    let assignment = engine.assign(blocked.id).unwrap();
    assert_eq!(assignment.assigned_to, tech.id);
    assert_counters_consistent(&engine);
}

// ---------------------------------------------------------------------------
// Shift updates
// ---------------------------------------------------------------------------

#[test]
fn going_off_shift_keeps_existing_assignments() {
    // Scenario E.
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();

    for _ in 0..2 {
        let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
        engine.assign(task.id).unwrap();
    }

    let updated = engine.update_shift(tech.id, Shift::Off).unwrap();
    assert_eq!(updated.shift, Shift::Off);
    assert_eq!(updated.active_tasks, 2);

    // Tasks stay with the technician.
    let tasks = engine.list_tasks().unwrap();
    assert!(tasks.iter().all(|t| t.assigned_to == Some(tech.id)));
    assert_counters_consistent(&engine);
}

#[test]
fn shift_update_for_missing_technician_is_not_found() {
    let mut engine = test_engine();
    let result = engine.update_shift(TechnicianId::new(), Shift::Off);
    assert!(matches!(result, Err(Error::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[test]
fn every_committed_transition_is_audited_in_order() {
    let mut engine = test_engine();
    let tech = engine.create_technician("T1", skills(&["IV"])).unwrap();
    let task = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap();
    engine.assign(task.id).unwrap();
    engine.start(task.id, tech.id).unwrap();
    engine.complete(task.id, tech.id).unwrap();
    engine.update_shift(tech.id, Shift::Off).unwrap();

    let entries = engine.audit_since(0).unwrap();
    let actions: Vec<AuditAction> = entries.iter().map(|e| e.action.clone()).collect();

    assert_eq!(
        actions,
        vec![
            AuditAction::TechnicianCreated,
            AuditAction::TaskCreated,
            AuditAction::TaskAssigned,
            AuditAction::TaskStarted,
            AuditAction::TaskCompleted,
            AuditAction::ShiftChanged(Shift::Off),
        ]
    );

    // Sequence numbers are monotonic.
    for window in entries.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }

    // Lifecycle entries are attributed to the acting technician.
    assert_eq!(entries[2].performed_by, tech.id.0.to_string());
    assert_eq!(entries[2].entity_id, task.id.0.to_string());
    assert_eq!(entries[4].performed_by, tech.id.0.to_string());
}

#[test]
fn audit_since_skips_earlier_entries() {
    let mut engine = test_engine();
    engine.create_technician("T1", skills(&["IV"])).unwrap();
    let all = engine.audit_since(0).unwrap();
    assert_eq!(all.len(), 1);

    engine.create_technician("T2", skills(&["Xray"])).unwrap();
    let later = engine.audit_since(all[0].seq).unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].action, AuditAction::TechnicianCreated);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatch.db");

    let tech_id;
    let task_id;
    {
        let mut engine = Engine::open(&path).unwrap();
        tech_id = engine.create_technician("T1", skills(&["IV"])).unwrap().id;
        task_id = engine.create_task(NewTask::new("blood-draw", "IV")).unwrap().id;
        engine.assign(task_id).unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    let task = engine.get_task(task_id).unwrap();
    assert_eq!(task.status, Status::Assigned);
    assert_eq!(task.assigned_to, Some(tech_id));
    assert_eq!(engine.get_technician(tech_id).unwrap().active_tasks, 1);
    assert_eq!(engine.audit_since(0).unwrap().len(), 3);
}
