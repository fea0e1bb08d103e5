use chrono::Utc;

use crate::account::{AccountStatus, SessionIntegrity};
use crate::audit::AuditLog;
use crate::error::Result;
use crate::tasks::Orchestrator;

pub fn handle_accounts(orch: &Orchestrator, status: Option<AccountStatus>) -> Result<()> {
    let accounts = match status {
        Some(status) => orch.sessions().list_by_status(orch.storage(), status)?,
        None => orch.sessions().list(orch.storage())?,
    };
    if accounts.is_empty() {
        println!("No accounts.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<18} {:<24} {:<12} {:<8} {:<4} Employee", "Phone", "Status", "Activity", "Health", "2FA");
    for account in &accounts {
        let details = account.details(now);
        println!(
            "{:<18} {:<24} {:<12} {:<8} {:<4} {}",
            details.phone,
            details.status.as_str(),
            format!("{:?}", details.activity).to_lowercase(),
            format!("{:?}", details.health).to_lowercase(),
            if details.two_factor_enabled { "yes" } else { "no" },
            details.employee_name.as_deref().unwrap_or("-"),
        );
    }
    println!("{} accounts", accounts.len());
    Ok(())
}

pub fn handle_show(orch: &Orchestrator, phone: &str) -> Result<()> {
    let view = orch.sessions().load(orch.storage(), phone)?;
    let details = view.account.details(Utc::now());
    println!("{}", serde_json::to_string_pretty(&details)?);
    if view.integrity == SessionIntegrity::Mismatch {
        println!("⚠️  Stored session hash does not match the session blob.");
    }
    Ok(())
}

pub fn handle_audit(orch: &Orchestrator, phone: Option<&str>, limit: usize) -> Result<()> {
    let records = match phone {
        Some(phone) => AuditLog::for_account(orch.storage(), phone, limit)?,
        None => AuditLog::recent(orch.storage(), limit)?,
    };
    for record in &records {
        println!(
            "{}  {:<18} {:<26} by {}{}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.account_ref,
            record.action_type.as_str(),
            record.performed_by,
            record.ip.as_deref().map(|ip| format!(" ({})", ip)).unwrap_or_default(),
            record.detail,
        );
    }
    if records.is_empty() {
        println!("No audit records.");
    }
    Ok(())
}
