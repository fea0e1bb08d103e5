//! Account record and its value types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::vault::{CredentialBundle, SCHEME_VERSION};

/// Unique account key: the platform phone identifier.
pub type Phone = String;

pub const ALERT_HISTORY_CAPACITY: usize = 10;

/// Lifecycle status of a custodied account.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Pending2fa,
    PendingReauthorization,
    Active,
    Suspended,
    Reclaimed,
    Dead,
    Flood,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Pending2fa => "pending_2fa",
            AccountStatus::PendingReauthorization => "pending_reauthorization",
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Reclaimed => "reclaimed",
            AccountStatus::Dead => "dead",
            AccountStatus::Flood => "flood",
        }
    }

    /// Still in initial onboarding.
    pub fn is_enrolling(&self) -> bool {
        matches!(self, AccountStatus::Pending | AccountStatus::Pending2fa)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AccountStatus::Reclaimed | AccountStatus::Suspended)
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AccountStatus::Pending),
            "pending_2fa" => Ok(AccountStatus::Pending2fa),
            "pending_reauthorization" => Ok(AccountStatus::PendingReauthorization),
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "reclaimed" => Ok(AccountStatus::Reclaimed),
            "dead" => Ok(AccountStatus::Dead),
            "flood" => Ok(AccountStatus::Flood),
            _ => Err(format!("Invalid account status: {}", s)),
        }
    }
}

/// Health dimension, recomputed on every check.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Healthy,
    Unreachable,
    RateLimited,
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityStatus::Healthy => write!(f, "healthy"),
            ActivityStatus::Unreachable => write!(f, "unreachable"),
            ActivityStatus::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// Client presentation parameters sent to the platform on connect.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceParams {
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub lang_code: String,
    pub system_lang_code: String,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            device_model: format!("CorporateManager_{}", std::env::consts::OS),
            system_version: std::env::consts::ARCH.to_string(),
            app_version: "1.0".to_string(),
            lang_code: "en".to_string(),
            system_lang_code: "en".to_string(),
        }
    }
}

/// How a lost manager session was classified at check time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionLossKind {
    /// Previous check was under an hour ago.
    Recent,
    Old,
    FirstCheck,
}

impl SessionLossKind {
    pub fn classify(last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_checked {
            None => SessionLossKind::FirstCheck,
            Some(at) if now - at < Duration::hours(1) => SessionLossKind::Recent,
            Some(_) => SessionLossKind::Old,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLossKind::Recent => "recent",
            SessionLossKind::Old => "old",
            SessionLossKind::FirstCheck => "first_check",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertContext {
    PlatformNotice,
    AccountReclaim,
    ManagerSessionLost(SessionLossKind),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Normal,
    High,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SecurityAlert {
    pub message: String,
    pub detected_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub context: AlertContext,
    pub severity: AlertSeverity,
}

impl SecurityAlert {
    pub fn new(message: impl Into<String>, context: AlertContext, detected_at: DateTime<Utc>) -> Self {
        let severity = match context {
            AlertContext::ManagerSessionLost(_) => AlertSeverity::High,
            _ => AlertSeverity::Normal,
        };
        Self {
            message: message.into(),
            detected_at,
            acknowledged: false,
            context,
            severity,
        }
    }

    pub fn manager_session_lost(kind: SessionLossKind, now: DateTime<Utc>) -> Self {
        let stamp = now.format("%H:%M:%S %d.%m.%Y");
        let message = match kind {
            SessionLossKind::Recent => format!(
                "Manager session terminated: detected at {} (recent event)",
                stamp
            ),
            SessionLossKind::Old => format!(
                "Manager session inactive: detected at {} (old event)",
                stamp
            ),
            SessionLossKind::FirstCheck => format!(
                "Manager session terminated: detected on first check at {}",
                stamp
            ),
        };
        Self::new(message, AlertContext::ManagerSessionLost(kind), now)
    }
}

/// Bounded, most-recent-first alert history.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertHistory {
    entries: VecDeque<SecurityAlert>,
}

impl AlertHistory {
    pub fn push(&mut self, alert: SecurityAlert) {
        self.entries.push_front(alert);
        self.entries.truncate(ALERT_HISTORY_CAPACITY);
    }

    pub fn latest(&self) -> Option<&SecurityAlert> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecurityAlert> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_unacknowledged(&self) -> bool {
        self.entries.iter().any(|a| !a.acknowledged)
    }

    /// Returns how many entries were newly acknowledged.
    pub fn acknowledge_all(&mut self) -> usize {
        let mut count = 0;
        for alert in self.entries.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            count += 1;
        }
        count
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityInfo {
    pub last_security_check: Option<DateTime<Utc>>,
    pub history: AlertHistory,
}

impl SecurityInfo {
    pub fn record(&mut self, alert: SecurityAlert) {
        self.history.push(alert);
    }

    pub fn has_security_alert(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn alert_message(&self) -> Option<&str> {
        self.history.latest().map(|a| a.message.as_str())
    }
}

/// Every secret field is an independent vault bundle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountSecrets {
    pub api_id: CredentialBundle,
    pub api_hash: CredentialBundle,
    pub session: CredentialBundle,
    pub recovery_email: CredentialBundle,
    /// Short-lived pending login (correlation token + in-progress session).
    pub code_token: Option<CredentialBundle>,
    /// Last password this system set on the platform account.
    pub cloud_password: Option<CredentialBundle>,
}

/// Persisted account record. Never hard-deleted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    // Identity
    pub phone: Phone,
    pub employee_id: Option<String>,
    pub employee_name: Option<String>,
    pub note: Option<String>,

    // Secrets
    pub secrets: AccountSecrets,
    /// Hex SHA-256 of the raw session blob, empty when no session is held.
    pub session_hash: String,
    pub session_updated_at: Option<DateTime<Utc>>,

    // State
    pub status: AccountStatus,
    pub activity: ActivityStatus,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub two_factor_enabled: bool,
    pub device: DeviceParams,
    pub proxy: Option<String>,
    pub encryption_version: u32,
    pub security: SecurityInfo,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(phone: Phone, secrets: AccountSecrets, status: AccountStatus, now: DateTime<Utc>) -> Self {
        Self {
            phone,
            employee_id: None,
            employee_name: None,
            note: None,
            secrets,
            session_hash: String::new(),
            session_updated_at: None,
            status,
            activity: ActivityStatus::Healthy,
            last_ping: None,
            last_checked: None,
            two_factor_enabled: false,
            device: DeviceParams::default(),
            proxy: None,
            encryption_version: SCHEME_VERSION,
            security: SecurityInfo::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_session(&self) -> bool {
        !self.session_hash.is_empty()
    }

    pub fn health(&self, now: DateTime<Utc>) -> HealthIndicator {
        HealthIndicator::from_last_ping(self.last_ping, now)
    }

    pub fn details(&self, now: DateTime<Utc>) -> AccountDetails {
        AccountDetails {
            phone: self.phone.clone(),
            employee_id: self.employee_id.clone(),
            employee_name: self.employee_name.clone(),
            note: self.note.clone(),
            status: self.status,
            activity: self.activity,
            health: self.health(now),
            has_session: self.has_session(),
            two_factor_enabled: self.two_factor_enabled,
            last_ping: self.last_ping,
            last_checked: self.last_checked,
            session_updated_at: self.session_updated_at,
            device: self.device.clone(),
            proxy: self.proxy.clone(),
            alerts: self.security.history.iter().cloned().collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Operator view of an account. Carries no secret material.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AccountDetails {
    pub phone: Phone,
    pub employee_id: Option<String>,
    pub employee_name: Option<String>,
    pub note: Option<String>,
    pub status: AccountStatus,
    pub activity: ActivityStatus,
    pub health: HealthIndicator,
    pub has_session: bool,
    pub two_factor_enabled: bool,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub session_updated_at: Option<DateTime<Utc>>,
    pub device: DeviceParams,
    pub proxy: Option<String>,
    pub alerts: Vec<SecurityAlert>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Traffic-light summary of liveness for operator views.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthIndicator {
    Unknown,
    Green,
    Yellow,
    Red,
}

impl HealthIndicator {
    pub fn from_last_ping(last_ping: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_ping {
            None => HealthIndicator::Unknown,
            Some(at) => {
                let age = now - at;
                if age < Duration::days(1) {
                    HealthIndicator::Green
                } else if age < Duration::days(7) {
                    HealthIndicator::Yellow
                } else {
                    HealthIndicator::Red
                }
            }
        }
    }
}
