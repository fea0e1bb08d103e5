//! Corporate reclaim: strip every device and rotate credentials.
//!
//! Once authorizations have been reset the workflow runs to completion and
//! always records what it managed to do.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::{settle, Ctx};
use crate::account::password::generate_password;
use crate::account::state::{next_status, transition};
use crate::account::{ActivityStatus, AlertContext, Trigger};
use crate::audit::AuditAction;
use crate::client::SessionClient;
use crate::security::{self, ScanHit};
use crate::tasks::outcome::Outcome;
use crate::tasks::pacing::PaceKind;
use crate::tasks::retry::StepError;

struct ReclaimReport {
    hit: Option<ScanHit>,
    sessions_terminated: bool,
    password_changed: bool,
}

/// `two_factor_password` is the operator's copy of the account's current
/// cloud password; it takes precedence over the stored one.
pub async fn run(ctx: &Ctx<'_>, phone: &str, two_factor_password: Option<String>) -> Outcome {
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(reclaim(ctx, phone, two_factor_password).await)
}

async fn reclaim(ctx: &Ctx<'_>, phone: &str, two_factor_password: Option<String>) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let view = ctx.sessions().load(storage, phone)?;
    if next_status(view.account.status, Trigger::ReclaimCompleted).is_none() {
        return Err(Outcome::rejected(format!(
            "reclaim requires an active account (current status: {})",
            view.account.status
        )));
    }
    let session = view
        .session
        .clone()
        .ok_or_else(|| Outcome::rejected("no stored session"))?;
    let current = match two_factor_password.filter(|p| !p.is_empty()) {
        Some(p) => Some(p),
        None => ctx.sessions().cloud_password(storage, phone)?,
    };
    let new_password = generate_password();

    let client = ctx.client_for(&view, Some(session))?;
    let result = strip_access(ctx, client.as_ref(), phone, current.as_deref(), &new_password).await;
    ctx.close(client.as_ref(), phone).await;
    let report = match result {
        Ok(report) => report,
        Err(outcome) => {
            record_aborted(ctx, phone, current.is_some(), &outcome);
            return Err(outcome);
        }
    };

    let now = Utc::now();
    if let Some(hit) = report.hit {
        ctx.sessions().record_alert(storage, phone, hit.into_alert(AlertContext::AccountReclaim, now))?;
    }
    if report.password_changed {
        ctx.sessions().store_cloud_password(storage, phone, &new_password)?;
    }
    ctx.sessions().delete_session(storage, phone, ctx.actor)?;

    let mut account = ctx.sessions().account(storage, phone)?;
    account.status = transition(account.status, Trigger::ReclaimCompleted)?;
    account.activity = ActivityStatus::Unreachable;
    ctx.sessions().put(storage, &mut account)?;

    let detail = json!({
        "sessionsTerminated": report.sessions_terminated,
        "passwordChanged": report.password_changed,
        "twoFactorUsed": current.is_some(),
    });
    ctx.audit(phone, AuditAction::AccountReclaimed, detail.clone())?;
    info!(
        "Account {} reclaimed (sessions terminated: {}, password changed: {})",
        phone, report.sessions_terminated, report.password_changed
    );

    if report.sessions_terminated && report.password_changed {
        Ok(Outcome::success("account reclaimed", detail))
    } else {
        Ok(Outcome::Partial {
            message: "account reclaimed, but not every step succeeded".to_string(),
            detail,
        })
    }
}

/// Nothing was changed on the platform; the attempt is still audited.
fn record_aborted(ctx: &Ctx<'_>, phone: &str, two_factor_used: bool, outcome: &Outcome) {
    warn!("Reclaim of {} stopped before any change: {}", phone, outcome.message());
    let detail = json!({
        "sessionsTerminated": false,
        "passwordChanged": false,
        "twoFactorUsed": two_factor_used,
        "reason": outcome.message(),
    });
    // The workflow outcome wins over a failed audit write.
    if let Err(audit_failure) = ctx.audit(phone, AuditAction::AccountReclaimed, detail) {
        warn!("Could not audit aborted reclaim of {}: {}", phone, audit_failure.message());
    }
}

async fn strip_access(
    ctx: &Ctx<'_>,
    client: &dyn SessionClient,
    phone: &str,
    current: Option<&str>,
    new_password: &str,
) -> Result<ReclaimReport, Outcome> {
    ctx.connect(client, phone).await.map_err(|e| ctx.step_outcome(e))?;
    if !ctx.call(client.is_authorized()).await.map_err(|e| ctx.step_outcome(e))? {
        return Err(Outcome::AuthExpired { message: "stored session is not authorized".to_string() });
    }

    let limit = ctx.orch.config().pacing.service_message_limit;
    let hit = match ctx.cancel.guard(security::scan(client, phone, limit, Utc::now())).await? {
        Ok(hit) => hit,
        Err(e) => {
            warn!("Security scan before reclaim of {} failed: {}", phone, e);
            None
        }
    };
    ctx.pause(PaceKind::Step).await?;

    let sessions_terminated = match ctx.call(client.reset_all_authorizations()).await {
        Ok(()) => true,
        Err(StepError::Cancelled) => return Err(Outcome::Cancelled),
        Err(StepError::Platform(e)) => {
            warn!("Could not reset authorizations for {}: {}", phone, e);
            false
        }
    };

    // Past this point the platform state may have changed; finish regardless.
    let committed = ctx.detached();
    let _ = committed.pause(PaceKind::Step).await;
    let password_changed = match committed.call(client.edit_password(current, new_password)).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Password rotation for {} failed (two-factor may block it): {:?}", phone, e);
            false
        }
    };

    let _ = committed.pause(PaceKind::Step).await;
    if let Err(e) = client.log_out().await {
        warn!("Log out for {} failed: {}", phone, e);
    }

    Ok(ReclaimReport { hit, sessions_terminated, password_changed })
}
