//! Code / 2FA verification shared by onboarding and reauthorization.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{settle, Ctx};
use crate::account::{transition, AccountStatus, PendingLogin, Trigger};
use crate::audit::AuditAction;
use crate::client::{PlatformError, SessionClient, SignIn};
use crate::tasks::outcome::Outcome;
use crate::tasks::pacing::PaceKind;
use crate::tasks::retry::StepError;

/// One-time code or 2FA password. Exactly one is supplied per attempt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyCredential {
    Code(String),
    Password(String),
}

impl std::fmt::Debug for VerifyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyCredential::Code(_) => f.write_str("Code(..)"),
            VerifyCredential::Password(_) => f.write_str("Password(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Enrollment,
    Reauthorization,
}

enum Attempt {
    Authorized(Vec<u8>),
    /// Code accepted, password still needed. Carries the in-progress session.
    NeedsPassword(Vec<u8>),
}

pub async fn run(ctx: &Ctx<'_>, phone: &str, credential: VerifyCredential) -> Outcome {
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(verify(ctx, phone, credential).await)
}

async fn verify(ctx: &Ctx<'_>, phone: &str, credential: VerifyCredential) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let view = ctx.sessions().load(storage, phone)?;
    let status = view.account.status;
    let mode = match status {
        AccountStatus::Pending | AccountStatus::Pending2fa => Mode::Enrollment,
        AccountStatus::PendingReauthorization | AccountStatus::Dead | AccountStatus::Flood => Mode::Reauthorization,
        other => return Err(Outcome::rejected(format!("nothing to verify: account is {}", other))),
    };
    if status == AccountStatus::Pending2fa && matches!(credential, VerifyCredential::Code(_)) {
        return Err(Outcome::TwoFactorRequired {
            message: "code already accepted; verify with the account password".to_string(),
        });
    }

    let pending = ctx
        .sessions()
        .get_code_token(storage, phone)?
        .ok_or_else(|| Outcome::CodeExpired {
            message: "no pending verification; request a new code".to_string(),
        })?;

    let sign_in = match &credential {
        VerifyCredential::Code(code) => SignIn::Code {
            phone: phone.to_string(),
            code: code.trim().to_string(),
            correlation_token: pending.correlation_token.clone(),
        },
        VerifyCredential::Password(password) => SignIn::Password(password.clone()),
    };

    let client = ctx.client_for(&view, Some(pending.session.clone()))?;
    let attempt = attempt(ctx, client.as_ref(), phone, sign_in).await;
    ctx.close(client.as_ref(), phone).await;

    match attempt {
        Ok(Attempt::Authorized(session)) => complete(ctx, phone, status, mode, &credential, &session),
        Ok(Attempt::NeedsPassword(session)) => {
            ctx.sessions().set_code_token(
                storage,
                phone,
                &PendingLogin { correlation_token: pending.correlation_token, session },
            )?;
            if mode == Mode::Enrollment && status == AccountStatus::Pending {
                ctx.sessions().apply_trigger(storage, phone, Trigger::TwoFactorRequired)?;
            }
            info!("{} needs its two-factor password to finish verification", phone);
            Ok(Outcome::TwoFactorRequired {
                message: "account is protected by a two-factor password; verify with it".to_string(),
            })
        }
        Err(StepError::Platform(PlatformError::CodeInvalid)) => Ok(Outcome::CodeInvalid {
            message: "verification code is invalid, try again".to_string(),
        }),
        Err(StepError::Platform(PlatformError::CodeExpired)) => {
            ctx.sessions().clear_code_token(storage, phone)?;
            Ok(Outcome::CodeExpired { message: "verification code expired, request a new one".to_string() })
        }
        Err(StepError::Platform(PlatformError::PasswordHashInvalid)) => Ok(Outcome::InvalidCredentials {
            message: "two-factor password is incorrect".to_string(),
        }),
        Err(StepError::Platform(PlatformError::PhoneUnregistered)) => {
            ctx.sessions().clear_code_token(storage, phone)?;
            warn!("{} is not registered on the platform", phone);
            Ok(ctx.platform_outcome(PlatformError::PhoneUnregistered))
        }
        Err(e) => Ok(ctx.step_outcome(e)),
    }
}

async fn attempt(ctx: &Ctx<'_>, client: &dyn SessionClient, phone: &str, sign_in: SignIn) -> Result<Attempt, StepError> {
    ctx.connect(client, phone).await?;
    ctx.pause(PaceKind::Step).await?;
    match ctx.call(client.sign_in(sign_in)).await {
        Ok(session) => Ok(Attempt::Authorized(session)),
        Err(StepError::Platform(PlatformError::PasswordRequired)) => {
            // The code is spent; keep the half-finished login whatever happens.
            let committed = ctx.detached();
            let _ = committed.pause(PaceKind::Step).await;
            let session = committed.call(client.export_session()).await?;
            Ok(Attempt::NeedsPassword(session))
        }
        Err(e) => Err(e),
    }
}

fn complete(
    ctx: &Ctx<'_>,
    phone: &str,
    status: AccountStatus,
    mode: Mode,
    credential: &VerifyCredential,
    session: &[u8],
) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let trigger = match (mode, status) {
        (Mode::Enrollment, AccountStatus::Pending) => Trigger::CodeVerified,
        (Mode::Enrollment, _) => Trigger::TwoFactorAccepted,
        (Mode::Reauthorization, _) => Trigger::ReauthorizationVerified,
    };
    transition(status, trigger)?;

    let account = ctx.sessions().update_session(storage, phone, session, ctx.actor)?;
    let two_factor = match credential {
        VerifyCredential::Password(password) => {
            ctx.sessions().store_cloud_password(storage, phone, password)?;
            true
        }
        VerifyCredential::Code(_) => account.two_factor_enabled,
    };

    match mode {
        Mode::Enrollment => {
            ctx.audit(
                phone,
                AuditAction::AccountAdded,
                json!({
                    "employee_id": account.employee_id,
                    "employee_name": account.employee_name,
                    "twoFactorEnabled": two_factor,
                }),
            )?;
            info!("Account {} enrolled", phone);
        }
        Mode::Reauthorization => {
            ctx.audit(
                phone,
                AuditAction::ReauthorizationCompleted,
                json!({ "previous_status": status.as_str(), "twoFactorEnabled": two_factor }),
            )?;
            info!("Account {} reauthorized", phone);
        }
    }
    Ok(Outcome::success("verification complete", json!({ "status": "active", "two_factor": two_factor })))
}
