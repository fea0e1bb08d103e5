use clap::Subcommand;
use uuid::Uuid;

use crate::error::{CustodianError, Result};
use crate::tasks::{Orchestrator, TaskStore};

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommands {
    /// Most recent tasks first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Full record of one task
    Show {
        id: String,
    },
    /// Mark a pending or running task cancelled
    Cancel {
        id: String,
    },
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CustodianError::InvalidState(format!("'{}' is not a task id: {}", raw, e)))
}

pub fn handle_task_command(orch: &Orchestrator, cmd: TaskCommands) -> Result<()> {
    match cmd {
        TaskCommands::List { limit } => {
            let tasks = TaskStore::list(orch.storage(), limit)?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  {:<16} {:<10} {:>3}%  {}  {}",
                    task.id,
                    format!("{:?}", task.kind),
                    task.status.to_string(),
                    task.progress,
                    task.created_at.format("%Y-%m-%d %H:%M:%S"),
                    task.targets.join(","),
                );
            }
        }
        TaskCommands::Show { id } => {
            let id = parse_id(&id)?;
            match orch.task(&id)? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("Task {} not found", id),
            }
        }
        TaskCommands::Cancel { id } => {
            let id = parse_id(&id)?;
            if orch.cancel(&id)? {
                println!("Task {} cancelled", id);
            } else {
                println!("Task {} already finished", id);
            }
        }
    }
    Ok(())
}
