use serde_json::json;
use tracing::info;

use super::{settle, Ctx};
use crate::account::Trigger;
use crate::audit::AuditAction;
use crate::tasks::outcome::Outcome;

/// Administrative suspension. No platform calls.
pub async fn run(ctx: &Ctx<'_>, phone: &str) -> Outcome {
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(suspend(ctx, phone))
}

fn suspend(ctx: &Ctx<'_>, phone: &str) -> Result<Outcome, Outcome> {
    let before = ctx.sessions().account(ctx.storage(), phone)?.status;
    let account = ctx.sessions().apply_trigger(ctx.storage(), phone, Trigger::Suspend)?;
    ctx.audit(
        phone,
        AuditAction::AccountSuspended,
        json!({ "previous_status": before.as_str() }),
    )?;
    info!("Account {} suspended", phone);
    Ok(Outcome::success("account suspended", json!({ "status": account.status.as_str() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use crate::client::mock::MockPlatform;
    use crate::tasks::orchestrator::WorkflowRequest;
    use crate::tasks::workflows::testkit::harness;

    #[tokio::test]
    async fn test_suspend_active_only() {
        let h = harness(MockPlatform::authorized());
        h.seed("+800", AccountStatus::Active, b"sess");
        h.seed("+801", AccountStatus::Pending, b"");

        let run = h.orch.run(WorkflowRequest::Suspend { phone: "+800".into() }, &h.actor).await.unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(h.status("+800"), AccountStatus::Suspended);

        let run = h.orch.run(WorkflowRequest::Suspend { phone: "+801".into() }, &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
        assert_eq!(h.status("+801"), AccountStatus::Pending);
        assert!(h.platform.calls().is_empty());
    }
}
