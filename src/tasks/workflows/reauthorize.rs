use serde_json::json;
use tracing::info;

use super::{settle, Ctx};
use crate::account::{AccountStatus, PendingLogin, Trigger};
use crate::audit::AuditAction;
use crate::client::SessionClient;
use crate::tasks::outcome::Outcome;
use crate::tasks::pacing::PaceKind;
use crate::tasks::retry::StepError;

/// Phase one: send a fresh code from a new client. The stored session is not
/// touched; phase two is `verify`.
pub async fn run(ctx: &Ctx<'_>, phone: &str) -> Outcome {
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(request(ctx, phone).await)
}

async fn request(ctx: &Ctx<'_>, phone: &str) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let view = ctx.sessions().load(storage, phone)?;
    let status = view.account.status;
    match status {
        AccountStatus::Active
        | AccountStatus::PendingReauthorization
        | AccountStatus::Dead
        | AccountStatus::Flood => {}
        other => {
            return Err(Outcome::rejected(format!("cannot reauthorize an account that is {}", other)));
        }
    }

    let client = ctx.client_for(&view, None)?;
    let result = send_code(ctx, client.as_ref(), phone).await;
    ctx.close(client.as_ref(), phone).await;
    let pending = result.map_err(|e| ctx.step_outcome(e))?;

    ctx.sessions().set_code_token(storage, phone, &pending)?;
    let status = if status == AccountStatus::Active {
        ctx.sessions().apply_trigger(storage, phone, Trigger::ReauthorizationRequested)?.status
    } else {
        status
    };

    ctx.audit(phone, AuditAction::ReauthorizationRequested, json!({ "status": status.as_str() }))?;
    info!("Reauthorization code sent for {}", phone);
    Ok(Outcome::success("verification code sent", json!({ "status": status.as_str() })))
}

/// Once the platform has sent a code the exchange is finished without
/// cancellation, so the code is never wasted.
pub(super) async fn send_code(ctx: &Ctx<'_>, client: &dyn SessionClient, phone: &str) -> Result<PendingLogin, StepError> {
    ctx.connect(client, phone).await?;
    ctx.pause(PaceKind::Step).await?;
    let correlation_token = ctx.call(client.request_code(phone)).await?;

    let committed = ctx.detached();
    let _ = committed.pause(PaceKind::Step).await;
    let session = committed.call(client.export_session()).await?;
    Ok(PendingLogin { correlation_token, session })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::client::mock::MockPlatform;
    use crate::client::PlatformError;
    use crate::tasks::orchestrator::WorkflowRequest;
    use crate::tasks::pacing::RecordingPacer;
    use crate::tasks::workflows::testkit::{harness, harness_with};

    #[tokio::test]
    async fn test_active_account_moves_to_pending_and_keeps_session() {
        let h = harness(MockPlatform::authorized());
        h.seed("+600", AccountStatus::Active, b"old-session");
        let run = h
            .orch
            .run(WorkflowRequest::Reauthorize { phone: "+600".into() }, &h.actor)
            .await
            .unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(h.status("+600"), AccountStatus::PendingReauthorization);

        let view = h.orch.sessions().load(h.orch.storage(), "+600").unwrap();
        assert_eq!(view.session.as_deref(), Some(&b"old-session"[..]));
        let pending = h.orch.sessions().get_code_token(h.orch.storage(), "+600").unwrap().unwrap();
        assert_eq!(pending.correlation_token, "corr-token");

        // Fresh client: no stored session handed to it.
        assert!(h.platform.built()[0].session.is_none());
        assert_eq!(h.platform.calls(), vec!["connect", "request_code", "export_session", "disconnect"]);
        assert_eq!(h.pacer.count(PaceKind::Step), 2);
        assert_eq!(
            AuditLog::count(h.orch.storage(), "+600", AuditAction::ReauthorizationRequested).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_before_the_code_is_sent_sends_nothing() {
        let pacer = RecordingPacer { cancel_after: Some(1), ..Default::default() };
        let h = harness_with(MockPlatform::authorized(), pacer);
        h.seed("+604", AccountStatus::Active, b"old");
        let run = h
            .orch
            .run(WorkflowRequest::Reauthorize { phone: "+604".into() }, &h.actor)
            .await
            .unwrap();
        assert_eq!(run.outcome, Outcome::Cancelled);
        assert_eq!(h.platform.count("request_code"), 0);
        assert_eq!(h.status("+604"), AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_dead_account_keeps_status() {
        let h = harness(MockPlatform::authorized());
        h.seed("+601", AccountStatus::Dead, b"old");
        let run = h
            .orch
            .run(WorkflowRequest::Reauthorize { phone: "+601".into() }, &h.actor)
            .await
            .unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(h.status("+601"), AccountStatus::Dead);
    }

    #[tokio::test]
    async fn test_reclaimed_account_is_rejected() {
        let h = harness(MockPlatform::authorized());
        h.seed("+602", AccountStatus::Reclaimed, b"");
        let run = h
            .orch
            .run(WorkflowRequest::Reauthorize { phone: "+602".into() }, &h.actor)
            .await
            .unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_flood_on_send_code() {
        let platform = MockPlatform::authorized();
        platform.with(|s| s.request_code_error = Some(PlatformError::FloodWait { seconds: 90 }));
        let h = harness(platform);
        h.seed("+603", AccountStatus::Active, b"old");
        let run = h
            .orch
            .run(WorkflowRequest::Reauthorize { phone: "+603".into() }, &h.actor)
            .await
            .unwrap();
        assert!(matches!(run.outcome, Outcome::RateLimited { wait_seconds: 90, .. }));
        assert_eq!(h.status("+603"), AccountStatus::Active);
        assert!(h.orch.sessions().get_code_token(h.orch.storage(), "+603").unwrap().is_none());
    }
}
