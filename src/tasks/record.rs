//! Persisted task records
//!
//! Every write is flushed, so a crash mid-run leaves the last reported
//! progress and per-account results on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::outcome::Outcome;
use crate::error::{CustodianError, Result};
use crate::storage::{Storage, TASKS_TREE};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Forward-only: pending -> processing -> terminal. Pending may also be
    /// cancelled before it starts.
    pub fn can_move_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Enroll,
    Verify,
    Check,
    BulkCheck,
    ChangePassword,
    Reclaim,
    Reauthorize,
    Suspend,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub targets: Vec<String>,
    /// Input parameters with secrets removed.
    pub params: Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct TaskStore;

impl TaskStore {
    pub fn create(
        storage: &Storage,
        kind: WorkflowKind,
        targets: Vec<String>,
        params: Value,
        actor: &str,
    ) -> Result<TaskRecord> {
        let record = TaskRecord {
            id: Uuid::new_v4(),
            kind,
            targets,
            params,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            actor: actor.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        Self::persist(storage, &record)?;
        Ok(record)
    }

    pub fn get(storage: &Storage, id: &Uuid) -> Result<Option<TaskRecord>> {
        storage.get_json(TASKS_TREE, &id.to_string())
    }

    /// Newest first.
    pub fn list(storage: &Storage, limit: usize) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = storage.scan_json(TASKS_TREE, "")?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    pub fn start(storage: &Storage, record: &mut TaskRecord) -> Result<()> {
        Self::advance(record, TaskStatus::Processing)?;
        record.started_at = Some(Utc::now());
        Self::persist(storage, record)
    }

    /// Progress never moves backwards; lower values are ignored.
    pub fn set_progress(storage: &Storage, record: &mut TaskRecord, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        if progress <= record.progress {
            return Ok(());
        }
        record.progress = progress;
        Self::persist_running(storage, record)
    }

    /// Store one entry of the partial result map, e.g. a per-account outcome.
    pub fn record_partial(storage: &Storage, record: &mut TaskRecord, key: &str, value: Value) -> Result<()> {
        let mut map = match record.result.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(key.to_string(), value);
        record.result = Some(Value::Object(map));
        Self::persist_running(storage, record)
    }

    /// Record the terminal outcome. A cancel mark written by someone else
    /// after the work had already finished is replaced by what really
    /// happened.
    pub fn finish(storage: &Storage, record: &mut TaskRecord, outcome: &Outcome) -> Result<()> {
        let status = outcome.task_status();
        Self::advance(record, status)?;
        if status != TaskStatus::Cancelled && Self::cancel_requested(storage, &record.id)? {
            warn!(
                "Task {} was marked cancelled while it ran; recording its {} outcome instead",
                record.id, status
            );
        }
        if status == TaskStatus::Completed {
            record.progress = 100;
        }
        if status == TaskStatus::Failed {
            record.error = Some(outcome.message().to_string());
        }
        let summary = outcome.to_value();
        record.result = Some(match record.result.take() {
            Some(Value::Object(mut map)) => {
                map.insert("outcome".to_string(), summary);
                Value::Object(map)
            }
            _ => summary,
        });
        record.completed_at = Some(Utc::now());
        Self::persist(storage, record)?;
        info!("Task {} ({:?}) {}: {}", record.id, record.kind, status, outcome.message());
        Ok(())
    }

    /// Whether the stored copy carries a cancel mark.
    pub fn cancel_requested(storage: &Storage, id: &Uuid) -> Result<bool> {
        Ok(Self::get(storage, id)?.is_some_and(|r| r.status == TaskStatus::Cancelled))
    }

    /// Cancel a task that has not reached a terminal status.
    pub fn cancel(storage: &Storage, id: &Uuid) -> Result<TaskRecord> {
        let mut record = Self::get(storage, id)?
            .ok_or_else(|| CustodianError::InvalidState(format!("task {} not found", id)))?;
        Self::advance(&mut record, TaskStatus::Cancelled)?;
        record.completed_at = Some(Utc::now());
        Self::persist(storage, &record)?;
        Ok(record)
    }

    /// Delete terminal records completed before `cutoff`.
    pub fn purge_terminal(storage: &Storage, cutoff: DateTime<Utc>) -> Result<usize> {
        let records: Vec<TaskRecord> = storage.scan_json(TASKS_TREE, "")?;
        let mut removed = 0;
        for record in records {
            let finished = record.completed_at.unwrap_or(record.created_at);
            if record.status.is_terminal() && finished < cutoff {
                storage.remove(TASKS_TREE, &record.id.to_string())?;
                removed += 1;
            }
        }
        if removed > 0 {
            storage.flush()?;
        }
        Ok(removed)
    }

    fn advance(record: &mut TaskRecord, next: TaskStatus) -> Result<()> {
        if !record.status.can_move_to(next) {
            return Err(CustodianError::InvalidState(format!(
                "task {} cannot move from {} to {}",
                record.id, record.status, next
            )));
        }
        record.status = next;
        Ok(())
    }

    /// Mid-run writes keep a cancel mark in place so the runner still sees it.
    fn persist_running(storage: &Storage, record: &TaskRecord) -> Result<()> {
        match Self::get(storage, &record.id)? {
            Some(stored) if stored.status == TaskStatus::Cancelled && !record.status.is_terminal() => {
                let mut marked = record.clone();
                marked.status = stored.status;
                marked.completed_at = stored.completed_at;
                Self::persist(storage, &marked)
            }
            _ => Self::persist(storage, record),
        }
    }

    fn persist(storage: &Storage, record: &TaskRecord) -> Result<()> {
        storage.put_json(TASKS_TREE, &record.id.to_string(), record)?;
        storage.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task(storage: &Storage) -> TaskRecord {
        TaskStore::create(storage, WorkflowKind::BulkCheck, vec!["+1".into(), "+2".into()], json!({}), "ops").unwrap()
    }

    #[test]
    fn test_lifecycle_is_forward_only() {
        let storage = Storage::temporary().unwrap();
        let mut task = new_task(&storage);
        assert!(TaskStore::finish(&storage, &mut task, &Outcome::success("x", json!({}))).is_err());

        TaskStore::start(&storage, &mut task).unwrap();
        assert!(TaskStore::start(&storage, &mut task).is_err());
        TaskStore::finish(&storage, &mut task, &Outcome::success("done", json!({}))).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(TaskStore::cancel(&storage, &task.id).is_err());

        let stored = TaskStore::get(&storage, &task.id).unwrap().unwrap();
        assert_eq!(stored, task);
    }

    #[test]
    fn test_progress_is_monotonic_and_partials_persist() {
        let storage = Storage::temporary().unwrap();
        let mut task = new_task(&storage);
        TaskStore::start(&storage, &mut task).unwrap();
        TaskStore::set_progress(&storage, &mut task, 50).unwrap();
        TaskStore::set_progress(&storage, &mut task, 20).unwrap();
        assert_eq!(task.progress, 50);

        TaskStore::record_partial(&storage, &mut task, "+1", json!("started")).unwrap();
        let stored = TaskStore::get(&storage, &task.id).unwrap().unwrap();
        assert_eq!(stored.progress, 50);
        assert_eq!(stored.result.unwrap()["+1"], "started");

        let failed = Outcome::rejected("nope");
        TaskStore::finish(&storage, &mut task, &failed).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("nope"));
        assert_eq!(task.result.as_ref().unwrap()["+1"], "started");
        assert_eq!(task.result.as_ref().unwrap()["outcome"]["status"], "rejected");
    }

    #[test]
    fn test_cancel_mark_survives_progress_until_finish() {
        let storage = Storage::temporary().unwrap();
        let mut task = new_task(&storage);
        TaskStore::start(&storage, &mut task).unwrap();
        assert!(!TaskStore::cancel_requested(&storage, &task.id).unwrap());

        // Another handle on the store marks it cancelled mid-run.
        TaskStore::cancel(&storage, &task.id).unwrap();
        TaskStore::set_progress(&storage, &mut task, 40).unwrap();
        TaskStore::record_partial(&storage, &mut task, "+1", json!("started")).unwrap();
        assert!(TaskStore::cancel_requested(&storage, &task.id).unwrap());
        assert_eq!(TaskStore::get(&storage, &task.id).unwrap().unwrap().progress, 40);

        // Work that already ran to completion is recorded as such.
        TaskStore::finish(&storage, &mut task, &Outcome::success("done", json!({}))).unwrap();
        let stored = TaskStore::get(&storage, &task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.unwrap()["+1"], "started");
    }

    #[test]
    fn test_purge_only_old_terminal_tasks() {
        let storage = Storage::temporary().unwrap();
        let mut done = new_task(&storage);
        TaskStore::start(&storage, &mut done).unwrap();
        TaskStore::finish(&storage, &mut done, &Outcome::Cancelled).unwrap();
        let pending = new_task(&storage);

        assert_eq!(TaskStore::purge_terminal(&storage, Utc::now() - chrono::Duration::days(7)).unwrap(), 0);
        assert_eq!(TaskStore::purge_terminal(&storage, Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(TaskStore::get(&storage, &done.id).unwrap().is_none());
        assert!(TaskStore::get(&storage, &pending.id).unwrap().is_some());
    }
}
