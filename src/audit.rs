//! Append-only audit log of state-changing actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::storage::{Storage, AUDIT_TREE};

pub const DEFAULT_LISTING_LIMIT: usize = 100;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionSaved,
    SessionUpdated,
    SessionDeleted,
    CodeRequested,
    AccountAdded,
    CheckSuccess,
    CheckFailed,
    SessionInvalid,
    FloodWait,
    PasswordChanged,
    AccountReclaimed,
    AccountSuspended,
    ReauthorizationRequested,
    ReauthorizationCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SessionSaved => "session_saved",
            AuditAction::SessionUpdated => "session_updated",
            AuditAction::SessionDeleted => "session_deleted",
            AuditAction::CodeRequested => "code_requested",
            AuditAction::AccountAdded => "account_added",
            AuditAction::CheckSuccess => "check_success",
            AuditAction::CheckFailed => "check_failed",
            AuditAction::SessionInvalid => "session_invalid",
            AuditAction::FloodWait => "flood_wait",
            AuditAction::PasswordChanged => "password_changed",
            AuditAction::AccountReclaimed => "account_reclaimed",
            AuditAction::AccountSuspended => "account_suspended",
            AuditAction::ReauthorizationRequested => "reauthorization_requested",
            AuditAction::ReauthorizationCompleted => "reauthorization_completed",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who initiated an action.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub performed_by: String,
    pub ip: Option<String>,
}

impl Actor {
    pub fn new(performed_by: impl Into<String>) -> Self {
        Self { performed_by: performed_by.into(), ip: None }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Actions started by the scheduler daemon.
    pub fn system() -> Self {
        Self::new("system")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: u64,
    pub account_ref: String,
    pub action_type: AuditAction,
    pub detail: Value,
    pub performed_by: String,
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Records are keyed `phone/id` so one account's history is a prefix scan.
pub struct AuditLog;

impl AuditLog {
    pub fn append(
        storage: &Storage,
        phone: &str,
        action: AuditAction,
        detail: Value,
        actor: &Actor,
    ) -> Result<AuditRecord> {
        let id = storage.next_id()?;
        let record = AuditRecord {
            id,
            account_ref: phone.to_string(),
            action_type: action,
            detail,
            performed_by: actor.performed_by.clone(),
            ip: actor.ip.clone(),
            timestamp: Utc::now(),
        };
        storage.put_json(AUDIT_TREE, &record_key(phone, id), &record)?;
        debug!("audit {} {} by {}", phone, action, actor.performed_by);
        Ok(record)
    }

    /// Most recent first.
    pub fn for_account(storage: &Storage, phone: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = storage.scan_json(AUDIT_TREE, &format!("{}/", phone))?;
        sort_newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    pub fn recent(storage: &Storage, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = storage.scan_json(AUDIT_TREE, "")?;
        sort_newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    pub fn count(storage: &Storage, phone: &str, action: AuditAction) -> Result<usize> {
        let records: Vec<AuditRecord> = storage.scan_json(AUDIT_TREE, &format!("{}/", phone))?;
        Ok(records.iter().filter(|r| r.action_type == action).count())
    }
}

fn record_key(phone: &str, id: u64) -> String {
    format!("{}/{:020}", phone, id)
}

fn sort_newest_first(records: &mut [AuditRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}
