use serde_json::json;
use tracing::{info, warn};

use super::{settle, Ctx};
use crate::account::password::generate_password;
use crate::account::AccountStatus;
use crate::audit::AuditAction;
use crate::client::{PlatformError, SessionClient};
use crate::tasks::outcome::{FailureKind, Outcome};
use crate::tasks::pacing::PaceKind;
use crate::tasks::retry::StepError;

pub async fn run(ctx: &Ctx<'_>, phone: &str, old_password: Option<String>, new_password: Option<String>) -> Outcome {
    let _guard = match ctx.lock(phone).await {
        Ok(guard) => guard,
        Err(cancelled) => return cancelled.into(),
    };
    settle(change(ctx, phone, old_password, new_password).await)
}

async fn change(
    ctx: &Ctx<'_>,
    phone: &str,
    old_password: Option<String>,
    new_password: Option<String>,
) -> Result<Outcome, Outcome> {
    let storage = ctx.storage();
    let view = ctx.sessions().load(storage, phone)?;
    if view.account.status != AccountStatus::Active {
        return Err(Outcome::rejected(format!(
            "password can only be changed on an active account (current status: {})",
            view.account.status
        )));
    }
    let session = view
        .session
        .clone()
        .ok_or_else(|| Outcome::rejected("no stored session"))?;

    // Fall back to the password this system set last time.
    let current = match old_password.filter(|p| !p.is_empty()) {
        Some(p) => Some(p),
        None => ctx.sessions().cloud_password(storage, phone)?,
    };
    let new_password = new_password
        .filter(|p| !p.is_empty())
        .unwrap_or_else(generate_password);

    let client = ctx.client_for(&view, Some(session))?;
    let result = edit(ctx, client.as_ref(), phone, current.as_deref(), &new_password).await;
    ctx.close(client.as_ref(), phone).await;
    let had_password = result?;

    ctx.sessions().store_cloud_password(storage, phone, &new_password)?;
    ctx.audit(
        phone,
        AuditAction::PasswordChanged,
        json!({ "password_changed": true, "has_2fa": had_password }),
    )?;
    info!("Password changed for {}", phone);
    Ok(Outcome::success(
        "password changed",
        json!({ "password_changed": true, "password_stored": true }),
    ))
}

/// Returns whether the account already had a password that was accepted.
async fn edit(
    ctx: &Ctx<'_>,
    client: &dyn SessionClient,
    phone: &str,
    current: Option<&str>,
    new_password: &str,
) -> Result<bool, Outcome> {
    ctx.connect(client, phone).await.map_err(|e| ctx.step_outcome(e))?;
    if !ctx.call(client.is_authorized()).await.map_err(|e| ctx.step_outcome(e))? {
        return Err(Outcome::AuthExpired { message: "stored session is not authorized".to_string() });
    }
    ctx.pause(PaceKind::Step).await?;

    match ctx.call(client.edit_password(current, new_password)).await {
        Ok(()) => Ok(current.is_some()),
        Err(StepError::Platform(PlatformError::PasswordHashInvalid)) if current.is_some() => {
            warn!("Current password rejected for {}; retrying without it", phone);
            ctx.pause(PaceKind::Step).await?;
            match ctx.call(client.edit_password(None, new_password)).await {
                Ok(()) => Ok(false),
                Err(StepError::Cancelled) => Err(Outcome::Cancelled),
                Err(StepError::Platform(e)) => Err(Outcome::failed(
                    FailureKind::Provider,
                    format!("current password was rejected and the retry without it failed: {}", e),
                )),
            }
        }
        Err(StepError::Platform(PlatformError::PasswordHashInvalid))
        | Err(StepError::Platform(PlatformError::PasswordRequired)) => Err(Outcome::InvalidCredentials {
            message: "account already has a password; supply the current one".to_string(),
        }),
        Err(e) => Err(ctx.step_outcome(e)),
    }
}
