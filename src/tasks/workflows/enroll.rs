//! Onboarding, step one: request a login code for a new account.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::reauthorize::send_code;
use super::{settle, Ctx};
use crate::account::{AccountStatus, SessionFields};
use crate::audit::AuditAction;
use crate::client::ClientParams;
use crate::tasks::outcome::Outcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub phone: String,
    pub employee_id: String,
    pub employee_name: String,
    pub recovery_email: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Name of a configured proxy.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl EnrollRequest {
    fn validate(&self) -> Result<(), String> {
        let digits = self.phone.strip_prefix('+').unwrap_or(&self.phone);
        if digits.len() < 5 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("'{}' is not a phone number", self.phone));
        }
        if self.employee_id.trim().is_empty() || self.employee_name.trim().is_empty() {
            return Err("employee reference and name are required".to_string());
        }
        let email = self.recovery_email.trim();
        match email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(format!("'{}' is not a recovery email", email)),
        }
    }
}

pub async fn run(ctx: &Ctx<'_>, request: EnrollRequest) -> Outcome {
    let _guard = match ctx.lock(&request.phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(enroll(ctx, request).await)
}

async fn enroll(ctx: &Ctx<'_>, request: EnrollRequest) -> Result<Outcome, Outcome> {
    request.validate().map_err(Outcome::rejected)?;
    let storage = ctx.storage();
    let phone = request.phone.as_str();

    if let Some(existing) = ctx.sessions().find(storage, phone)? {
        if !existing.status.is_enrolling() {
            return Err(Outcome::rejected(format!(
                "account is already {}; use reauthorize instead",
                existing.status
            )));
        }
    }

    let app = ctx.orch.config().platform.app_credentials()?;
    let device = ctx.orch.config().platform.device.clone();
    let proxy = ctx.resolve_proxy(request.proxy.as_deref())?;
    let client = ctx.build_client(ClientParams {
        phone: phone.to_string(),
        api_id: app.api_id,
        api_hash: app.api_hash.clone(),
        session: None,
        device: device.clone(),
        proxy,
    })?;
    let result = send_code(ctx, client.as_ref(), phone).await;
    ctx.close(client.as_ref(), phone).await;
    let pending = result.map_err(|e| ctx.step_outcome(e))?;

    ctx.sessions().save(
        storage,
        SessionFields {
            phone: phone.to_string(),
            employee_id: Some(request.employee_id.trim().to_string()),
            employee_name: Some(request.employee_name.trim().to_string()),
            note: request.note.clone(),
            api_id: app.api_id.to_string(),
            api_hash: app.api_hash,
            session: Vec::new(),
            recovery_email: request.recovery_email.trim().to_string(),
            status: AccountStatus::Pending,
            two_factor_enabled: false,
            device,
            proxy: request.proxy.clone(),
        },
        ctx.actor,
    )?;
    ctx.sessions().set_code_token(storage, phone, &pending)?;
    ctx.audit(
        phone,
        AuditAction::CodeRequested,
        json!({ "employee_id": request.employee_id, "employee_name": request.employee_name }),
    )?;
    info!("Verification code requested for {}", phone);
    Ok(Outcome::success("verification code sent", json!({ "status": "pending" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockPlatform;
    use crate::client::PlatformError;
    use crate::tasks::orchestrator::WorkflowRequest;
    use crate::tasks::workflows::testkit::harness;

    fn request(phone: &str) -> EnrollRequest {
        EnrollRequest {
            phone: phone.to_string(),
            employee_id: "E-77".to_string(),
            employee_name: "Sam Roe".to_string(),
            recovery_email: "it@corp.example".to_string(),
            note: Some("sales desk".to_string()),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_enroll_stores_pending_account_with_token() {
        let h = harness(MockPlatform::authorized());
        let run = h.orch.run(WorkflowRequest::Enroll(request("+15550001")), &h.actor).await.unwrap();
        assert!(run.outcome.is_success());
        assert_eq!(h.status("+15550001"), AccountStatus::Pending);

        let view = h.orch.sessions().load(h.orch.storage(), "+15550001").unwrap();
        assert_eq!(view.api_id, "424242");
        assert_eq!(view.recovery_email, "it@corp.example");
        assert!(view.session.is_none());
        let pending = h.orch.sessions().get_code_token(h.orch.storage(), "+15550001").unwrap().unwrap();
        assert_eq!(pending.correlation_token, "corr-token");
        assert_eq!(pending.session, b"partial-session".to_vec());
        assert_eq!(h.platform.calls(), vec!["connect", "request_code", "export_session", "disconnect"]);
        assert_eq!(h.pacer.count(crate::tasks::pacing::PaceKind::Step), 2);
    }

    #[tokio::test]
    async fn test_enroll_validates_input() {
        let h = harness(MockPlatform::authorized());
        let mut bad = request("+15550002");
        bad.recovery_email = "nobody".to_string();
        let run = h.orch.run(WorkflowRequest::Enroll(bad), &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_refuses_active_account() {
        let h = harness(MockPlatform::authorized());
        h.seed("+15550003", AccountStatus::Active, b"sess");
        let run = h.orch.run(WorkflowRequest::Enroll(request("+15550003")), &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
        assert_eq!(h.status("+15550003"), AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_proxy_is_rejected() {
        let h = harness(MockPlatform::authorized());
        let mut req = request("+15550004");
        req.proxy = Some("nowhere".to_string());
        let run = h.orch.run(WorkflowRequest::Enroll(req), &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_rejected_app_credentials() {
        let platform = MockPlatform::authorized();
        platform.with(|s| s.request_code_error = Some(PlatformError::ApiIdInvalid));
        let h = harness(platform);
        let run = h.orch.run(WorkflowRequest::Enroll(request("+15550005")), &h.actor).await.unwrap();
        assert!(matches!(run.outcome, Outcome::InvalidCredentials { .. }));
        assert!(h.orch.sessions().find(h.orch.storage(), "+15550005").unwrap().is_none());
    }
}
