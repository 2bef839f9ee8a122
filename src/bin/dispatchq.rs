//! dispatchq CLI — operator interface to the dispatch engine.

use std::io::Read;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dispatchq::config::Config;
use dispatchq::engine::Engine;
use dispatchq::model::{Priority, Shift, Status, Task, TaskId, Technician, TechnicianId, NewTask};
use dispatchq::policy::{self, DecisionRequest, ExternalProcess};

#[derive(Parser)]
#[command(name = "dispatchq", about = "Skill-constrained task dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Technician operations
    Tech {
        #[command(subcommand)]
        action: TechAction,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Dump the audit trail in append order
    Audit {
        /// Only entries after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Act as an external decision function: JSON request on stdin,
    /// JSON response on stdout
    Decide,
}

#[derive(Subcommand)]
enum TechAction {
    /// Register a technician
    Add {
        code_name: String,
        /// Skill tags (at least one)
        #[arg(required = true)]
        skills: Vec<String>,
    },
    /// List technicians
    List,
    /// Update a technician's shift
    Shift {
        /// Technician ID (full UUID or prefix)
        id: String,
        /// "on" or "off"
        shift: Shift,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a new task
    Add {
        task_type: String,
        required_skill: String,
        #[arg(long, default_value = "routine")]
        priority: Priority,
        /// Due time, RFC 3339
        #[arg(long)]
        deadline: Option<String>,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<Status>,
    },
    /// Assign a pending task to the best eligible technician
    Assign {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Start an assigned task
    Start {
        id: String,
        /// Technician ID (full UUID or prefix)
        technician: String,
    },
    /// Complete an in-progress task
    Complete {
        id: String,
        technician: String,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // The decide contract needs no database and must keep stdout clean.
    if matches!(cli.command, Command::Decide) {
        return cmd_decide();
    }

    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mut engine = Engine::open(&config.db_path)?;
    engine.capacity = config.capacity;
    if let Some(ref cmd) = config.decide_command {
        engine = engine.with_policy(Box::new(ExternalProcess::new(cmd)));
    }

    match cli.command {
        Command::Tech { action } => match action {
            TechAction::Add { code_name, skills } => cmd_tech_add(&mut engine, code_name, skills),
            TechAction::List => cmd_tech_list(&engine),
            TechAction::Shift { id, shift } => cmd_tech_shift(&mut engine, &id, shift),
        },
        Command::Task { action } => match action {
            TaskAction::Add {
                task_type,
                required_skill,
                priority,
                deadline,
            } => cmd_task_add(&mut engine, task_type, required_skill, priority, deadline),
            TaskAction::List { status } => cmd_task_list(&engine, status),
            TaskAction::Assign { id } => cmd_task_assign(&mut engine, &id),
            TaskAction::Start { id, technician } => cmd_task_start(&mut engine, &id, &technician),
            TaskAction::Complete { id, technician } => {
                cmd_task_complete(&mut engine, &id, &technician)
            }
        },
        Command::Audit { since } => cmd_audit(&engine, since),
        Command::Decide => unreachable!("handled above"),
    }
}

fn cmd_decide() -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let response = match serde_json::from_str::<DecisionRequest>(&input) {
        Ok(request) => policy::decide(&request),
        Err(_) => policy::DecisionResponse {
            assigned_to: None,
            error: Some("Invalid input".to_string()),
        },
    };

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn cmd_tech_add(engine: &mut Engine, code_name: String, skills: Vec<String>) -> anyhow::Result<()> {
    let tech = engine.create_technician(code_name, skills)?;
    println!("Created technician {} ({})", tech.id, tech.code_name);
    Ok(())
}

fn cmd_tech_list(engine: &Engine) -> anyhow::Result<()> {
    let technicians = engine.list_technicians()?;

    if technicians.is_empty() {
        println!("No technicians.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<8}  {:<6}  SKILLS",
        "ID", "CODE_NAME", "SHIFT", "ACTIVE"
    );
    println!("{}", "-".repeat(72));
    for tech in &technicians {
        println!(
            "{:<8}  {:<16}  {:<8}  {:<6}  {}",
            tech.id.to_string(),
            tech.code_name,
            tech.shift.to_string(),
            tech.active_tasks,
            tech.skills.join(", ")
        );
    }
    println!("\n{} technician(s)", technicians.len());
    Ok(())
}

fn cmd_tech_shift(engine: &mut Engine, id: &str, shift: Shift) -> anyhow::Result<()> {
    let tech_id = resolve_technician(engine, id)?;
    let tech = engine.update_shift(tech_id, shift)?;
    println!("Technician {} is now {}", tech.id, tech.shift);
    Ok(())
}

fn cmd_task_add(
    engine: &mut Engine,
    task_type: String,
    required_skill: String,
    priority: Priority,
    deadline: Option<String>,
) -> anyhow::Result<()> {
    let mut new = NewTask::new(task_type, required_skill).priority(priority);
    if let Some(raw) = deadline {
        let parsed = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid deadline {raw}: {e}"))?;
        new = new.deadline(parsed);
    }

    let task = engine.create_task(new)?;
    println!("Created task {} (status: {})", task.id, task.status);
    Ok(())
}

fn cmd_task_list(engine: &Engine, status: Option<Status>) -> anyhow::Result<()> {
    let tasks = match status {
        Some(status) => engine.list_tasks_by_status(status)?,
        None => engine.list_tasks()?,
    };

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:<12}  {:<9}  {:<11}  {:<8}  CREATED",
        "ID", "TYPE", "SKILL", "PRIORITY", "STATUS", "ASSIGNEE"
    );
    println!("{}", "-".repeat(96));
    for task in &tasks {
        let assignee = task
            .assigned_to
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8}  {:<14}  {:<12}  {:<9}  {:<11}  {:<8}  {}",
            task.id.to_string(),
            task.task_type,
            task.required_skill,
            task.priority.to_string(),
            task.status.to_string(),
            assignee,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

fn cmd_task_assign(engine: &mut Engine, id: &str) -> anyhow::Result<()> {
    let task_id = resolve_task(engine, id)?;
    let assignment = engine.assign(task_id)?;
    println!(
        "Task {} assigned to {}",
        assignment.task_id, assignment.assigned_to
    );
    Ok(())
}

fn cmd_task_start(engine: &mut Engine, id: &str, technician: &str) -> anyhow::Result<()> {
    let task_id = resolve_task(engine, id)?;
    let tech_id = resolve_technician(engine, technician)?;
    engine.start(task_id, tech_id)?;
    println!("Task {task_id} started");
    Ok(())
}

fn cmd_task_complete(engine: &mut Engine, id: &str, technician: &str) -> anyhow::Result<()> {
    let task_id = resolve_task(engine, id)?;
    let tech_id = resolve_technician(engine, technician)?;
    engine.complete(task_id, tech_id)?;
    let task = engine.get_task(task_id)?;
    match task.duration_seconds {
        Some(secs) => println!("Task {task_id} completed in {secs}s"),
        None => println!("Task {task_id} completed"),
    }
    Ok(())
}

fn cmd_audit(engine: &Engine, since: u64) -> anyhow::Result<()> {
    let entries = engine.audit_since(since)?;

    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{:>6}  {}  {}  {}  {}",
            entry.seq,
            entry.timestamp.to_rfc3339(),
            entry.entity_id,
            entry.action,
            entry.performed_by
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ID resolution — accept a full UUID or a unique prefix
// ---------------------------------------------------------------------------

fn resolve_task(engine: &Engine, id_str: &str) -> anyhow::Result<TaskId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_str) {
        return Ok(TaskId(uuid));
    }

    let tasks = engine.list_tasks()?;
    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no task matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} tasks match prefix '{id_str}' — be more specific"),
    }
}

fn resolve_technician(engine: &Engine, id_str: &str) -> anyhow::Result<TechnicianId> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id_str) {
        return Ok(TechnicianId(uuid));
    }

    let technicians = engine.list_technicians()?;
    let matches: Vec<&Technician> = technicians
        .iter()
        .filter(|t| t.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no technician matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} technicians match prefix '{id_str}' — be more specific"),
    }
}
