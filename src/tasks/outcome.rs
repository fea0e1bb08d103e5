use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use super::pacing::Cancelled;
use super::record::TaskStatus;
use crate::error::CustodianError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Stored ciphertext failed authentication.
    Integrity,
    Storage,
    /// Network trouble that outlasted the retry budget.
    Transient,
    Provider,
}

/// Result of one workflow step. Every platform error ends up as one of
/// these; nothing raw crosses the orchestrator boundary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { message: String, detail: Value },
    /// Finished, but some steps did not succeed. `detail` says which.
    Partial { message: String, detail: Value },
    TwoFactorRequired { message: String },
    RateLimited { message: String, wait_seconds: u64, retry_at: DateTime<Utc> },
    CodeInvalid { message: String },
    CodeExpired { message: String },
    PhoneUnregistered { message: String },
    AuthExpired { message: String },
    InvalidCredentials { message: String },
    /// Request not applicable to the account's current state.
    Rejected { message: String },
    Failed { message: String, kind: FailureKind },
    Cancelled,
}

impl Outcome {
    pub fn success(message: impl Into<String>, detail: Value) -> Self {
        Outcome::Success { message: message.into(), detail }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Outcome::Rejected { message: message.into() }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failed { message: message.into(), kind }
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Success { message, .. }
            | Outcome::Partial { message, .. }
            | Outcome::TwoFactorRequired { message }
            | Outcome::RateLimited { message, .. }
            | Outcome::CodeInvalid { message }
            | Outcome::CodeExpired { message }
            | Outcome::PhoneUnregistered { message }
            | Outcome::AuthExpired { message }
            | Outcome::InvalidCredentials { message }
            | Outcome::Rejected { message }
            | Outcome::Failed { message, .. } => message,
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Terminal task status for a workflow that ended with this outcome.
    /// A 2FA pause is a completed step, not a failure.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Outcome::Success { .. } | Outcome::Partial { .. } | Outcome::TwoFactorRequired { .. } => {
                TaskStatus::Completed
            }
            Outcome::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "status": "unserializable" }))
    }
}

impl From<Cancelled> for Outcome {
    fn from(_: Cancelled) -> Self {
        Outcome::Cancelled
    }
}

impl From<CustodianError> for Outcome {
    fn from(err: CustodianError) -> Self {
        match err {
            CustodianError::Integrity(e) => {
                error!("Credential integrity failure: {}", e);
                Outcome::failed(FailureKind::Integrity, format!("stored credentials failed verification: {}", e))
            }
            CustodianError::AccountNotFound(phone) => Outcome::rejected(format!("account {} not found", phone)),
            CustodianError::InvalidTransition { from, trigger } => {
                Outcome::rejected(format!("{:?} is not allowed while the account is {}", trigger, from))
            }
            CustodianError::InvalidState(msg) => Outcome::rejected(msg),
            CustodianError::Config(msg) => Outcome::failed(FailureKind::Provider, msg),
            other => {
                error!("Storage failure inside workflow: {}", other);
                Outcome::failed(FailureKind::Storage, other.to_string())
            }
        }
    }
}
