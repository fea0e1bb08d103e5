//! Workflow implementations
//!
//! Each workflow takes the per-account lock first, opens its own client and
//! always disconnects it before touching persisted state.

pub mod change_password;
pub mod check;
pub mod enroll;
pub mod reauthorize;
pub mod reclaim;
pub mod suspend;
pub mod verify;

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use super::orchestrator::Orchestrator;
use super::outcome::{FailureKind, Outcome};
use super::pacing::{CancelToken, Cancelled, PaceKind};
use super::record::TaskStore;
use super::retry::{with_retry, StepError};
use crate::account::{SessionStore, SessionView};
use crate::audit::{Actor, AuditAction, AuditLog};
use crate::client::{ClientParams, ErrorClass, PlatformError, SessionClient};
use crate::config::ProxyConfig;
use crate::storage::Storage;

/// What a running workflow can reach.
pub struct Ctx<'a> {
    pub orch: &'a Orchestrator,
    pub actor: &'a Actor,
    pub cancel: CancelToken,
    /// Task whose stored record is polled for cancellation at each pause.
    pub task: Option<Uuid>,
}

impl<'a> Ctx<'a> {
    pub fn storage(&self) -> &Storage {
        self.orch.storage()
    }

    pub fn sessions(&self) -> &SessionStore {
        self.orch.sessions()
    }

    /// Same context, but no longer cancellable. Used once a workflow has
    /// made a change on the platform that must be recorded.
    pub fn detached(&self) -> Ctx<'a> {
        Ctx { orch: self.orch, actor: self.actor, cancel: CancelToken::new(), task: None }
    }

    pub async fn lock(&self, phone: &str) -> Result<OwnedMutexGuard<()>, Cancelled> {
        let guard = self.orch.locks().acquire(phone, &self.cancel).await?;
        self.observe_stored_cancel()?;
        Ok(guard)
    }

    pub async fn pause(&self, kind: PaceKind) -> Result<(), Cancelled> {
        let delay = self.orch.pacing().window(kind).pick();
        self.orch.pacer().pause(kind, delay, &self.cancel).await?;
        self.observe_stored_cancel()
    }

    /// A cancel written to the task record by another handle trips the
    /// token, so the workflow stops at its next suspension point.
    fn observe_stored_cancel(&self) -> Result<(), Cancelled> {
        let Some(id) = self.task else {
            return Ok(());
        };
        match TaskStore::cancel_requested(self.storage(), &id) {
            Ok(false) => Ok(()),
            Ok(true) => {
                info!("Task {} was cancelled from its stored record", id);
                self.cancel.cancel();
                Err(Cancelled)
            }
            Err(e) => {
                warn!("Could not read task {} while checking for cancellation: {}", id, e);
                Ok(())
            }
        }
    }

    pub fn resolve_proxy(&self, name: Option<&str>) -> Result<Option<ProxyConfig>, Outcome> {
        match name {
            None => Ok(None),
            Some(name) => self
                .orch
                .config()
                .proxy(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| Outcome::rejected(format!("proxy '{}' is not configured", name))),
        }
    }

    pub fn build_client(&self, params: ClientParams) -> Result<Box<dyn SessionClient>, Outcome> {
        self.orch
            .clients()
            .build(params)
            .map_err(|e| self.platform_outcome(e))
    }

    /// Client for a stored account, optionally starting from `session`.
    pub fn client_for(&self, view: &SessionView, session: Option<Vec<u8>>) -> Result<Box<dyn SessionClient>, Outcome> {
        let api_id = view.api_id.trim().parse::<i64>().map_err(|_| {
            Outcome::failed(FailureKind::Integrity, "stored api_id is not a number")
        })?;
        let proxy = self.resolve_proxy(view.account.proxy.as_deref())?;
        self.build_client(ClientParams {
            phone: view.account.phone.clone(),
            api_id,
            api_hash: view.api_hash.clone(),
            session,
            device: view.account.device.clone(),
            proxy,
        })
    }

    pub async fn connect(&self, client: &dyn SessionClient, phone: &str) -> Result<(), StepError> {
        let what = format!("connect {}", phone);
        with_retry(self.orch.retry(), self.orch.pacer(), &self.cancel, &what, || client.connect()).await
    }

    /// One cancellable platform request.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, StepError>
    where
        F: Future<Output = Result<T, PlatformError>>,
    {
        Ok(self.cancel.guard(fut).await??)
    }

    pub async fn close(&self, client: &dyn SessionClient, phone: &str) {
        if let Err(e) = client.disconnect().await {
            warn!("disconnect for {} failed: {}", phone, e);
        }
    }

    pub fn audit(&self, phone: &str, action: AuditAction, detail: Value) -> Result<(), Outcome> {
        AuditLog::append(self.storage(), phone, action, detail, self.actor)?;
        Ok(())
    }

    pub fn step_outcome(&self, err: StepError) -> Outcome {
        match err {
            StepError::Cancelled => Outcome::Cancelled,
            StepError::Platform(e) => self.platform_outcome(e),
        }
    }

    /// Default mapping from the adapter taxonomy to a structured outcome.
    pub fn platform_outcome(&self, err: PlatformError) -> Outcome {
        match err.class() {
            ErrorClass::RateLimited => {
                let wait_seconds = err.flood_wait().unwrap_or(0);
                let defer = self.orch.retry().defer_for(wait_seconds);
                Outcome::RateLimited {
                    message: format!("rate limited by the platform for {}s", wait_seconds),
                    wait_seconds,
                    retry_at: Utc::now() + chrono::Duration::seconds(defer.as_secs() as i64),
                }
            }
            ErrorClass::AuthExpired => Outcome::AuthExpired { message: "session is no longer authorized".to_string() },
            ErrorClass::InvalidCredentials => Outcome::InvalidCredentials { message: err.to_string() },
            ErrorClass::TwoFactorRequired => Outcome::TwoFactorRequired {
                message: "account is protected by a two-factor password".to_string(),
            },
            ErrorClass::CodeInvalid => Outcome::CodeInvalid { message: "verification code is invalid, try again".to_string() },
            ErrorClass::CodeExpired => Outcome::CodeExpired {
                message: "verification code expired, request a new one".to_string(),
            },
            ErrorClass::PhoneUnregistered => Outcome::PhoneUnregistered {
                message: "phone number is not registered on the platform".to_string(),
            },
            ErrorClass::Transient => Outcome::failed(FailureKind::Transient, err.to_string()),
            ErrorClass::Provider => Outcome::failed(FailureKind::Provider, err.to_string()),
        }
    }
}

/// Collapse the early-return form workflows are written in.
pub(crate) fn settle(result: Result<Outcome, Outcome>) -> Outcome {
    match result {
        Ok(outcome) | Err(outcome) => outcome,
    }
}
