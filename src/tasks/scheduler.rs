//! Deferred re-enqueue queue and the scheduler daemon
//!
//! Rate-limited work is written to the `deferred` tree with the earliest time
//! it may run. The daemon drains due jobs, submits the daily bulk check and
//! purges old task records.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::orchestrator::{Orchestrator, WorkflowRequest};
use super::pacing::CancelToken;
use super::record::{TaskStore, WorkflowKind};
use crate::account::AccountStatus;
use crate::audit::Actor;
use crate::error::Result;
use crate::storage::{Storage, DEFERRED_TREE, META_TREE};

const LAST_DAILY_CHECK_KEY: &str = "last_daily_check";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeferredJob {
    pub phone: String,
    pub kind: WorkflowKind,
    /// Never run before this.
    pub due_at: DateTime<Utc>,
    pub wait_seconds: u64,
}

impl DeferredJob {
    pub fn check(phone: &str, due_at: DateTime<Utc>, wait_seconds: u64) -> Self {
        DeferredJob { phone: phone.to_string(), kind: WorkflowKind::Check, due_at, wait_seconds }
    }

    fn request(&self) -> Option<WorkflowRequest> {
        match self.kind {
            WorkflowKind::Check => Some(WorkflowRequest::Check { phone: self.phone.clone() }),
            _ => None,
        }
    }
}

/// One pending job per phone; a newer deferral replaces the older one.
pub struct DeferredQueue;

impl DeferredQueue {
    pub fn push(storage: &Storage, job: &DeferredJob) -> Result<()> {
        storage.put_json(DEFERRED_TREE, &job.phone, job)?;
        storage.flush()
    }

    /// Soonest first.
    pub fn pending(storage: &Storage) -> Result<Vec<DeferredJob>> {
        let mut jobs: Vec<DeferredJob> = storage.scan_json(DEFERRED_TREE, "")?;
        jobs.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        Ok(jobs)
    }

    /// Remove and return every job due at `now`.
    pub fn take_due(storage: &Storage, now: DateTime<Utc>) -> Result<Vec<DeferredJob>> {
        let due: Vec<DeferredJob> = Self::pending(storage)?
            .into_iter()
            .filter(|job| job.due_at <= now)
            .collect();
        for job in &due {
            storage.remove(DEFERRED_TREE, &job.phone)?;
        }
        if !due.is_empty() {
            storage.flush()?;
        }
        Ok(due)
    }
}

pub struct Scheduler {
    orch: Arc<Orchestrator>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(orch: Arc<Orchestrator>, cancel: CancelToken) -> Self {
        Scheduler { orch, cancel }
    }

    /// Work due at `now`. Claims deferred jobs and purges expired task
    /// records as a side effect.
    pub fn plan(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowRequest>> {
        let storage = self.orch.storage();
        let config = &self.orch.config().scheduler;
        let mut requests = Vec::new();

        let last: Option<DateTime<Utc>> = storage.get_json(META_TREE, LAST_DAILY_CHECK_KEY)?;
        let interval = ChronoDuration::seconds(config.daily_interval().as_secs() as i64);
        if last.map_or(true, |last| now - last >= interval) {
            let phones: Vec<String> = self
                .orch
                .sessions()
                .list_by_status(storage, AccountStatus::Active)?
                .into_iter()
                .map(|a| a.phone)
                .collect();
            if !phones.is_empty() {
                info!("Daily check due for {} active accounts", phones.len());
                requests.push(WorkflowRequest::BulkCheck { phones });
            }
            storage.put_json(META_TREE, LAST_DAILY_CHECK_KEY, &now)?;
        }

        for job in DeferredQueue::take_due(storage, now)? {
            match job.request() {
                Some(request) => {
                    debug!("Deferred {:?} for {} is due", job.kind, job.phone);
                    requests.push(request);
                }
                None => warn!("Dropping deferred {:?} for {}: not re-enqueueable", job.kind, job.phone),
            }
        }

        let cutoff = now - ChronoDuration::days(config.task_retention_days);
        let purged = TaskStore::purge_terminal(storage, cutoff)?;
        if purged > 0 {
            info!("Purged {} task records older than {} days", purged, config.task_retention_days);
        }

        Ok(requests)
    }

    /// Runs until the cancel token fires, then cancels in-flight tasks and
    /// waits for them to record their outcome.
    pub async fn start(self) {
        let tick = self.orch.config().scheduler.tick();
        info!("🕑 Scheduler started (tick every {}s)", tick.as_secs());

        let mut interval = tokio::time::interval(tick);
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.plan(Utc::now()) {
                        Ok(requests) => {
                            for request in requests {
                                let orch = self.orch.clone();
                                in_flight.spawn(async move {
                                    match orch.run(request, &Actor::system()).await {
                                        Ok(run) => info!("Scheduled task {} finished: {}", run.task.id, run.task.status),
                                        Err(e) => error!("Scheduled task failed to run: {}", e),
                                    }
                                });
                            }
                        }
                        Err(e) => error!("Scheduler tick failed: {}", e),
                    }
                    while in_flight.try_join_next().is_some() {}
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        let stopped = self.orch.cancel_all();
        info!("Scheduler stopping, cancelling {} running tasks", stopped);
        while in_flight.join_next().await.is_some() {}
    }
}
