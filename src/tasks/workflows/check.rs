//! Liveness check, single and bulk

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::{settle, Ctx};
use crate::account::state::next_status;
use crate::account::{ActivityStatus, AlertContext, SecurityAlert, SessionLossKind, Trigger};
use crate::audit::AuditAction;
use crate::client::{ErrorClass, PlatformError, SessionClient};
use crate::security::{self, ScanHit};
use crate::tasks::outcome::Outcome;
use crate::tasks::pacing::PaceKind;
use crate::tasks::record::{TaskRecord, TaskStore};
use crate::tasks::retry::StepError;
use crate::tasks::scheduler::{DeferredJob, DeferredQueue};

enum Liveness {
    NotAuthorized,
    Authorized { hit: Option<ScanHit>, dialogs: usize },
}

pub async fn run_single(ctx: &Ctx<'_>, phone: &str) -> Outcome {
    if ctx.pause(PaceKind::AntiFlood).await.is_err() {
        return Outcome::Cancelled;
    }
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    check_account(ctx, phone).await
}

/// Accounts are checked one after another, never concurrently. Each account
/// is preceded by exactly one delay: anti-flood for the first, the bulk gap
/// for the rest.
pub async fn run_bulk(ctx: &Ctx<'_>, phones: &[String], task: &mut TaskRecord) -> Outcome {
    settle(bulk(ctx, phones, task).await)
}

async fn bulk(ctx: &Ctx<'_>, phones: &[String], task: &mut TaskRecord) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let total = phones.len();
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for (i, phone) in phones.iter().enumerate() {
        ctx.orch.set_progress(task, (i * 100 / total) as u8)?;

        let kind = if i == 0 { PaceKind::AntiFlood } else { PaceKind::BulkGap };
        ctx.pause(kind).await?;

        TaskStore::record_partial(storage, task, phone, json!("started"))?;
        let outcome = {
            let _guard = ctx.lock(phone).await?;
            check_account(ctx, phone).await
        };
        TaskStore::record_partial(storage, task, phone, outcome.to_value())?;

        match outcome {
            Outcome::Cancelled => return Err(Outcome::Cancelled),
            Outcome::Success { .. } => succeeded += 1,
            _ => failed += 1,
        }
    }

    ctx.orch.set_progress(task, 100)?;
    let detail = json!({ "total": total, "succeeded": succeeded, "failed": failed });
    info!("Bulk check finished: {}/{} healthy", succeeded, total);
    if failed == 0 {
        Ok(Outcome::success(format!("checked {} accounts", total), detail))
    } else {
        Ok(Outcome::Partial { message: format!("{} of {} accounts failed the check", failed, total), detail })
    }
}

/// One account, lock already held.
pub async fn check_account(ctx: &Ctx<'_>, phone: &str) -> Outcome {
    settle(check_inner(ctx, phone).await)
}

async fn check_inner(ctx: &Ctx<'_>, phone: &str) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let view = ctx.sessions().load(storage, phone)?;

    let session = match view.session.clone() {
        Some(session) => session,
        None => {
            let mut account = view.account;
            account.activity = ActivityStatus::Unreachable;
            account.last_checked = Some(Utc::now());
            ctx.sessions().put(storage, &mut account)?;
            return Ok(Outcome::rejected("no stored session to check"));
        }
    };

    let client = ctx.client_for(&view, Some(session))?;
    let observed = inspect(ctx, client.as_ref(), phone).await;
    ctx.close(client.as_ref(), phone).await;

    let now = Utc::now();
    match observed {
        Ok(Liveness::Authorized { hit, dialogs }) => record_alive(ctx, phone, hit, dialogs, now),
        Ok(Liveness::NotAuthorized) => record_session_lost(ctx, phone, now),
        Err(StepError::Cancelled) => Ok(Outcome::Cancelled),
        Err(StepError::Platform(err)) => record_platform_error(ctx, phone, err, now),
    }
}

async fn inspect(ctx: &Ctx<'_>, client: &dyn SessionClient, phone: &str) -> Result<Liveness, StepError> {
    ctx.connect(client, phone).await?;
    if !ctx.call(client.is_authorized()).await? {
        return Ok(Liveness::NotAuthorized);
    }

    let limits = &ctx.orch.config().pacing;
    let hit = match ctx
        .cancel
        .guard(security::scan(client, phone, limits.service_message_limit, Utc::now()))
        .await?
    {
        Ok(hit) => hit,
        Err(e) => {
            warn!("Security scan for {} failed: {}", phone, e);
            None
        }
    };

    let dialogs = match ctx.cancel.guard(client.list_dialogs(limits.dialog_limit)).await? {
        Ok(count) => count,
        Err(e) => {
            warn!("Dialog sampling for {} failed: {}", phone, e);
            0
        }
    };

    Ok(Liveness::Authorized { hit, dialogs })
}

fn record_alive(
    ctx: &Ctx<'_>,
    phone: &str,
    hit: Option<ScanHit>,
    dialogs: usize,
    now: DateTime<Utc>,
) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let mut account = ctx.sessions().account(storage, phone)?;

    let alert_message = hit.as_ref().map(|h| h.text.clone());
    if let Some(hit) = hit {
        account.security.record(hit.into_alert(AlertContext::PlatformNotice, now));
    }
    account.security.last_security_check = Some(now);
    account.activity = ActivityStatus::Healthy;
    account.last_ping = Some(now);
    account.last_checked = Some(now);
    if let Some(next) = next_status(account.status, Trigger::CheckSucceeded) {
        info!("{} recovered: {} -> {}", phone, account.status, next);
        account.status = next;
    }
    ctx.sessions().put(storage, &mut account)?;

    let detail = json!({
        "dialog_count": dialogs,
        "has_security_alert": alert_message.is_some(),
        "alert_message": alert_message,
    });
    ctx.audit(phone, AuditAction::CheckSuccess, detail.clone())?;
    Ok(Outcome::success("account is alive", detail))
}

fn record_session_lost(ctx: &Ctx<'_>, phone: &str, now: DateTime<Utc>) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let mut account = ctx.sessions().account(storage, phone)?;

    let kind = SessionLossKind::classify(account.last_checked, now);
    account.security.record(SecurityAlert::manager_session_lost(kind, now));
    mark_dead(&mut account, phone);
    account.last_checked = Some(now);
    ctx.sessions().put(storage, &mut account)?;

    ctx.audit(
        phone,
        AuditAction::CheckFailed,
        json!({ "reason": "not_authorized", "session_loss": kind.as_str(), "status": account.status.as_str() }),
    )?;
    warn!("Manager session lost for {} ({})", phone, kind.as_str());
    Ok(Outcome::AuthExpired { message: "manager session is no longer authorized".to_string() })
}

fn record_platform_error(
    ctx: &Ctx<'_>,
    phone: &str,
    err: PlatformError,
    now: DateTime<Utc>,
) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let mut account = ctx.sessions().account(storage, phone)?;
    account.last_checked = Some(now);

    match err.class() {
        ErrorClass::AuthExpired => {
            mark_dead(&mut account, phone);
            ctx.sessions().put(storage, &mut account)?;
            ctx.audit(phone, AuditAction::SessionInvalid, json!({ "error": err.to_string() }))?;
            Ok(ctx.platform_outcome(err))
        }
        ErrorClass::RateLimited => {
            let wait_seconds = err.flood_wait().unwrap_or(0);
            if let Some(next) = next_status(account.status, Trigger::CheckRateLimited) {
                account.status = next;
            }
            account.activity = ActivityStatus::RateLimited;
            ctx.sessions().put(storage, &mut account)?;

            let defer = ctx.orch.retry().defer_for(wait_seconds);
            let due_at = now + chrono::Duration::seconds(defer.as_secs() as i64);
            DeferredQueue::push(storage, &DeferredJob::check(phone, due_at, wait_seconds))?;
            ctx.audit(
                phone,
                AuditAction::FloodWait,
                json!({ "wait_seconds": wait_seconds, "retry_at": due_at }),
            )?;
            warn!("{} rate limited for {}s, re-check due at {}", phone, wait_seconds, due_at);
            Ok(Outcome::RateLimited {
                message: format!("rate limited by the platform for {}s", wait_seconds),
                wait_seconds,
                retry_at: due_at,
            })
        }
        _ => {
            ctx.sessions().put(storage, &mut account)?;
            ctx.audit(phone, AuditAction::CheckFailed, json!({ "error": err.to_string() }))?;
            Ok(ctx.platform_outcome(err))
        }
    }
}

fn mark_dead(account: &mut crate::account::Account, phone: &str) {
    if let Some(next) = next_status(account.status, Trigger::CheckNotAuthorized) {
        account.status = next;
    } else {
        info!("{} is {}; leaving status unchanged", phone, account.status);
    }
    account.activity = ActivityStatus::Unreachable;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use crate::audit::AuditLog;
    use crate::client::mock::MockPlatform;
    use crate::client::ServiceMessage;
    use crate::tasks::orchestrator::WorkflowRequest;
    use crate::tasks::pacing::RecordingPacer;
    use crate::tasks::record::{TaskStatus, WorkflowKind};
    use crate::tasks::workflows::testkit::harness;
    use chrono::Duration;

    #[tokio::test]
    async fn test_healthy_check_records_alert_and_audit() {
        let platform = MockPlatform::authorized();
        platform.with(|s| {
            s.service_messages = vec![ServiceMessage {
                text: "Someone requested a password reset".to_string(),
                posted_at: Utc::now() - Duration::hours(1),
            }]
        });
        let h = harness(platform);
        h.seed("+100", AccountStatus::Active, b"sess");

        let run = h.orch.run(WorkflowRequest::Check { phone: "+100".into() }, &h.actor).await.unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(run.task.status, TaskStatus::Completed);

        let account = h.orch.sessions().account(h.orch.storage(), "+100").unwrap();
        assert_eq!(account.activity, ActivityStatus::Healthy);
        assert!(account.last_ping.is_some());
        assert_eq!(account.security.alert_message(), Some("Someone requested a password reset"));

        let audit = AuditLog::for_account(h.orch.storage(), "+100", 10).unwrap();
        assert_eq!(audit[0].action_type, AuditAction::CheckSuccess);
        assert_eq!(audit[0].detail["has_security_alert"], true);
        assert_eq!(audit[0].detail["dialog_count"], 7);
        assert_eq!(h.pacer.count(PaceKind::AntiFlood), 1);
        assert_eq!(h.platform.count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_session_marks_dead_with_alert() {
        let platform = MockPlatform::authorized();
        platform.with(|s| s.authorized = false);
        let h = harness(platform);
        h.seed("+101", AccountStatus::Active, b"sess");

        let run = h.orch.run(WorkflowRequest::Check { phone: "+101".into() }, &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::AuthExpired { .. }));
        let account = h.orch.sessions().account(h.orch.storage(), "+101").unwrap();
        assert_eq!(account.status, AccountStatus::Dead);
        assert_eq!(account.activity, ActivityStatus::Unreachable);
        let alert = account.security.history.latest().unwrap();
        assert_eq!(alert.context, AlertContext::ManagerSessionLost(SessionLossKind::FirstCheck));
        assert_eq!(AuditLog::count(h.orch.storage(), "+101", AuditAction::CheckFailed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_authorization_reply_is_not_session_loss() {
        let platform = MockPlatform::authorized();
        platform.with(|s| {
            s.authorized_error = Some(PlatformError::Provider("malformed isAuthorized reply: null".into()))
        });
        let h = harness(platform);
        h.seed("+105", AccountStatus::Active, b"sess");

        let run = h.orch.run(WorkflowRequest::Check { phone: "+105".into() }, &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Failed { .. }));
        assert_eq!(h.status("+105"), AccountStatus::Active);
        let account = h.orch.sessions().account(h.orch.storage(), "+105").unwrap();
        assert!(account.security.history.latest().is_none());
        assert_eq!(AuditLog::count(h.orch.storage(), "+105", AuditAction::CheckFailed).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_no_earlier_than_wait() {
        let platform = MockPlatform::authorized();
        platform.with(|s| s.authorized_error = Some(PlatformError::FloodWait { seconds: 300 }));
        let h = harness(platform);
        h.seed("+102", AccountStatus::Active, b"sess");

        let before = Utc::now();
        let run = h.orch.run(WorkflowRequest::Check { phone: "+102".into() }, &h.actor).await.unwrap();
        let Outcome::RateLimited { wait_seconds, retry_at, .. } = run.outcome else {
            panic!("expected rate limit, got {:?}", run.outcome);
        };
        assert_eq!(wait_seconds, 300);
        assert!(retry_at >= before + Duration::seconds(300));

        // No inline retry.
        assert_eq!(h.platform.count("is_authorized"), 1);
        assert_eq!(h.pacer.count(PaceKind::Backoff), 0);

        let queued = DeferredQueue::pending(h.orch.storage()).unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].due_at >= before + Duration::seconds(300));
        assert!(DeferredQueue::take_due(h.orch.storage(), before + Duration::seconds(299)).unwrap().is_empty());

        assert_eq!(h.status("+102"), AccountStatus::Flood);
        assert_eq!(AuditLog::count(h.orch.storage(), "+102", AuditAction::FloodWait).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_successful_check_recovers_flood_account() {
        let h = harness(MockPlatform::authorized());
        h.seed("+103", AccountStatus::Flood, b"sess");
        let run = h.orch.run(WorkflowRequest::Check { phone: "+103".into() }, &h.actor).await.unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(h.status("+103"), AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_session_is_rejected() {
        let h = harness(MockPlatform::authorized());
        h.seed("+104", AccountStatus::Active, b"");
        let run = h.orch.run(WorkflowRequest::Check { phone: "+104".into() }, &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
        assert!(h.platform.built().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_paces_each_account_and_progress_is_monotonic() {
        let h = harness(MockPlatform::authorized());
        let phones: Vec<String> = (0..3).map(|i| format!("+20{}", i)).collect();
        for phone in &phones {
            h.seed(phone, AccountStatus::Active, b"sess");
        }

        let mut events = h.orch.subscribe_progress();
        let run = h
            .orch
            .run(WorkflowRequest::BulkCheck { phones: phones.clone() }, &h.actor)
            .await
            .unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(run.task.kind, WorkflowKind::BulkCheck);

        let kinds: Vec<PaceKind> = h.pacer.recorded().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![PaceKind::AntiFlood, PaceKind::BulkGap, PaceKind::BulkGap]);
        for (kind, delay) in h.pacer.recorded() {
            if kind == PaceKind::BulkGap {
                assert!(delay >= std::time::Duration::from_secs(60));
                assert!(delay <= std::time::Duration::from_secs(120));
            }
        }

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.task_id == run.task.id {
                progress.push(event.progress);
            }
        }
        assert_eq!(progress, vec![0, 33, 66, 100]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let result = run.task.result.unwrap();
        for phone in &phones {
            assert_eq!(result[phone.as_str()]["status"], "success");
        }
    }

    #[tokio::test]
    async fn test_bulk_of_nothing_completes_immediately() {
        let h = harness(MockPlatform::authorized());
        let run = h.orch.run(WorkflowRequest::BulkCheck { phones: vec![] }, &h.actor).await.unwrap();
        assert_eq!(run.task.status, TaskStatus::Completed);
        assert_eq!(run.task.progress, 100);
        assert!(h.pacer.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_cancellation_leaves_inspectable_partials() {
        let pacer = RecordingPacer { cancel_after: Some(2), ..Default::default() };
        let h = crate::tasks::workflows::testkit::harness_with(MockPlatform::authorized(), pacer);
        let phones: Vec<String> = (0..3).map(|i| format!("+30{}", i)).collect();
        for phone in &phones {
            h.seed(phone, AccountStatus::Active, b"sess");
        }

        let run = h.orch.run(WorkflowRequest::BulkCheck { phones }, &h.actor).await.unwrap();
        assert_eq!(run.outcome, Outcome::Cancelled);
        assert_eq!(run.task.status, TaskStatus::Cancelled);
        let result = run.task.result.unwrap();
        assert_eq!(result["+300"]["status"], "success");
        assert!(result.get("+301").is_none());
    }
}
