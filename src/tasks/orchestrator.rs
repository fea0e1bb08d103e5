//! Task Orchestrator
//!
//! Every workflow request becomes a persisted [`TaskRecord`]. Execution is
//! bounded by a worker pool; each running task carries its own cancel token.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use super::locks::AccountLocks;
use super::outcome::Outcome;
use super::pacing::{CancelToken, Pacer, Pacing};
use super::record::{TaskRecord, TaskStatus, TaskStore, WorkflowKind};
use super::retry::RetryPolicy;
use super::workflows::enroll::EnrollRequest;
use super::workflows::verify::VerifyCredential;
use super::workflows::{change_password, check, enroll, reauthorize, reclaim, suspend, verify, Ctx};
use crate::account::SessionStore;
use crate::audit::Actor;
use crate::client::ClientFactory;
use crate::config::CustodianConfig;
use crate::error::{CustodianError, Result};
use crate::storage::Storage;
use crate::vault::Vault;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum WorkflowRequest {
    Enroll(EnrollRequest),
    Verify { phone: String, credential: VerifyCredential },
    Check { phone: String },
    BulkCheck { phones: Vec<String> },
    ChangePassword { phone: String, old_password: Option<String>, new_password: Option<String> },
    Reclaim { phone: String, two_factor_password: Option<String> },
    Reauthorize { phone: String },
    Suspend { phone: String },
}

impl WorkflowRequest {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            WorkflowRequest::Enroll(_) => WorkflowKind::Enroll,
            WorkflowRequest::Verify { .. } => WorkflowKind::Verify,
            WorkflowRequest::Check { .. } => WorkflowKind::Check,
            WorkflowRequest::BulkCheck { .. } => WorkflowKind::BulkCheck,
            WorkflowRequest::ChangePassword { .. } => WorkflowKind::ChangePassword,
            WorkflowRequest::Reclaim { .. } => WorkflowKind::Reclaim,
            WorkflowRequest::Reauthorize { .. } => WorkflowKind::Reauthorize,
            WorkflowRequest::Suspend { .. } => WorkflowKind::Suspend,
        }
    }

    pub fn targets(&self) -> Vec<String> {
        match self {
            WorkflowRequest::Enroll(req) => vec![req.phone.clone()],
            WorkflowRequest::BulkCheck { phones } => phones.clone(),
            WorkflowRequest::Verify { phone, .. }
            | WorkflowRequest::Check { phone }
            | WorkflowRequest::ChangePassword { phone, .. }
            | WorkflowRequest::Reclaim { phone, .. }
            | WorkflowRequest::Reauthorize { phone }
            | WorkflowRequest::Suspend { phone } => vec![phone.clone()],
        }
    }

    /// Parameters as persisted on the task record. Codes and passwords are
    /// reduced to whether they were supplied.
    pub fn params(&self) -> Value {
        match self {
            WorkflowRequest::Enroll(req) => json!({
                "phone": req.phone,
                "employee_id": req.employee_id,
                "employee_name": req.employee_name,
                "note": req.note,
                "proxy": req.proxy,
            }),
            WorkflowRequest::Verify { phone, credential } => {
                let with = match credential {
                    VerifyCredential::Code(_) => "code",
                    VerifyCredential::Password(_) => "password",
                };
                json!({ "phone": phone, "credential": with })
            }
            WorkflowRequest::BulkCheck { phones } => json!({ "phones": phones }),
            WorkflowRequest::ChangePassword { phone, old_password, new_password } => json!({
                "phone": phone,
                "old_password_supplied": old_password.is_some(),
                "new_password_supplied": new_password.is_some(),
            }),
            WorkflowRequest::Reclaim { phone, two_factor_password } => json!({
                "phone": phone,
                "two_factor_password_supplied": two_factor_password.is_some(),
            }),
            WorkflowRequest::Check { phone }
            | WorkflowRequest::Reauthorize { phone }
            | WorkflowRequest::Suspend { phone } => json!({ "phone": phone }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub progress: u8,
}

/// A finished task and the outcome its workflow produced.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: TaskRecord,
    pub outcome: Outcome,
}

pub struct Orchestrator {
    storage: Storage,
    sessions: SessionStore,
    clients: Arc<dyn ClientFactory>,
    pacer: Arc<dyn Pacer>,
    pacing: Pacing,
    retry: RetryPolicy,
    config: Arc<CustodianConfig>,
    locks: AccountLocks,
    workers: Semaphore,
    running: Mutex<HashMap<Uuid, CancelToken>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Orchestrator {
    pub fn new(
        storage: Storage,
        vault: Arc<Vault>,
        clients: Arc<dyn ClientFactory>,
        pacer: Arc<dyn Pacer>,
        config: Arc<CustodianConfig>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Orchestrator {
            storage,
            sessions: SessionStore::new(vault),
            clients,
            pacer,
            pacing: Pacing::from_config(&config.pacing),
            retry: RetryPolicy::from_config(&config.retry),
            locks: AccountLocks::new(),
            workers: Semaphore::new(config.workers.pool_size.max(1)),
            running: Mutex::new(HashMap::new()),
            progress_tx,
            config,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn clients(&self) -> &dyn ClientFactory {
        self.clients.as_ref()
    }

    pub fn pacer(&self) -> &dyn Pacer {
        self.pacer.as_ref()
    }

    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn config(&self) -> &CustodianConfig {
        &self.config
    }

    pub fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Persist and publish task progress. Never moves backwards.
    pub fn set_progress(&self, task: &mut TaskRecord, progress: u8) -> Result<()> {
        TaskStore::set_progress(&self.storage, task, progress)?;
        // No subscribers is fine.
        let _ = self.progress_tx.send(ProgressEvent { task_id: task.id, progress: task.progress });
        Ok(())
    }

    /// Create a task for `request`, run it to a terminal status and return it.
    pub async fn run(&self, request: WorkflowRequest, actor: &Actor) -> Result<TaskRun> {
        let mut task = TaskStore::create(
            &self.storage,
            request.kind(),
            request.targets(),
            request.params(),
            &actor.performed_by,
        )?;
        let cancel = CancelToken::new();
        self.register(task.id, cancel.clone());
        let result = self.execute(&mut task, request, actor, cancel).await;
        self.unregister(&task.id);
        let outcome = result?;
        Ok(TaskRun { task, outcome })
    }

    async fn execute(
        &self,
        task: &mut TaskRecord,
        request: WorkflowRequest,
        actor: &Actor,
        cancel: CancelToken,
    ) -> Result<Outcome> {
        let _permit = match cancel.guard(self.workers.acquire()).await {
            Ok(permit) => permit.map_err(|_| CustodianError::InvalidState("worker pool closed".to_string()))?,
            Err(_) => {
                info!("Task {} cancelled before it started", task.id);
                *task = match TaskStore::get(&self.storage, &task.id)? {
                    Some(stored) if stored.status == TaskStatus::Cancelled => stored,
                    _ => TaskStore::cancel(&self.storage, &task.id)?,
                };
                return Ok(Outcome::Cancelled);
            }
        };

        if let Some(stored) = TaskStore::get(&self.storage, &task.id)?.filter(|r| r.status == TaskStatus::Cancelled) {
            info!("Task {} was cancelled while waiting for a worker", task.id);
            *task = stored;
            return Ok(Outcome::Cancelled);
        }

        TaskStore::start(&self.storage, task)?;
        info!("▶ Task {} ({:?}) started for {:?}", task.id, task.kind, task.targets);

        let ctx = Ctx { orch: self, actor, cancel, task: Some(task.id) };
        let outcome = match request {
            WorkflowRequest::Enroll(req) => enroll::run(&ctx, req).await,
            WorkflowRequest::Verify { phone, credential } => verify::run(&ctx, &phone, credential).await,
            WorkflowRequest::Check { phone } => check::run_single(&ctx, &phone).await,
            WorkflowRequest::BulkCheck { phones } => check::run_bulk(&ctx, &phones, task).await,
            WorkflowRequest::ChangePassword { phone, old_password, new_password } => {
                change_password::run(&ctx, &phone, old_password, new_password).await
            }
            WorkflowRequest::Reclaim { phone, two_factor_password } => {
                reclaim::run(&ctx, &phone, two_factor_password).await
            }
            WorkflowRequest::Reauthorize { phone } => reauthorize::run(&ctx, &phone).await,
            WorkflowRequest::Suspend { phone } => suspend::run(&ctx, &phone).await,
        };

        TaskStore::finish(&self.storage, task, &outcome)?;
        Ok(outcome)
    }

    fn register(&self, id: Uuid, token: CancelToken) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token);
    }

    fn unregister(&self, id: &Uuid) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Signal a task running in this process, or mark a stored task that is
    /// not running here as cancelled. A runner elsewhere sees the mark at its
    /// next pause. Returns false if the task already finished.
    pub fn cancel(&self, id: &Uuid) -> Result<bool> {
        let token = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
            info!("Cancellation requested for task {}", id);
            return Ok(true);
        }

        match TaskStore::get(&self.storage, id)? {
            Some(record) if !record.status.is_terminal() => {
                TaskStore::cancel(&self.storage, id)?;
                warn!("Task {} was {} but not running here; marked cancelled", id, record.status);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CustodianError::InvalidState(format!("task {} not found", id))),
        }
    }

    /// Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn task(&self, id: &Uuid) -> Result<Option<TaskRecord>> {
        TaskStore::get(&self.storage, id)
    }
}

impl TaskRun {
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }
}
