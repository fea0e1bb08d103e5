//! Account lifecycle transitions.
//!
//! Every status change goes through [`transition`]. Pairs not listed in the
//! table are rejected and leave the record untouched.

use serde::{Deserialize, Serialize};

use super::types::AccountStatus;
use crate::error::{CustodianError, Result};

/// Events that can move an account between statuses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Login code accepted during onboarding.
    CodeVerified,
    /// Onboarding login needs the account's second factor.
    TwoFactorRequired,
    TwoFactorAccepted,
    /// Health check found the stored session unauthorized.
    CheckNotAuthorized,
    CheckRateLimited,
    /// Health check succeeded on a dead or rate-limited account.
    CheckSucceeded,
    ReclaimCompleted,
    ReauthorizationRequested,
    ReauthorizationVerified,
    Suspend,
}

impl Trigger {
    pub const ALL: [Trigger; 10] = [
        Trigger::CodeVerified,
        Trigger::TwoFactorRequired,
        Trigger::TwoFactorAccepted,
        Trigger::CheckNotAuthorized,
        Trigger::CheckRateLimited,
        Trigger::CheckSucceeded,
        Trigger::ReclaimCompleted,
        Trigger::ReauthorizationRequested,
        Trigger::ReauthorizationVerified,
        Trigger::Suspend,
    ];
}

/// Target status for `(from, trigger)`, or `None` when the pair is not allowed.
pub fn next_status(from: AccountStatus, trigger: Trigger) -> Option<AccountStatus> {
    use AccountStatus::*;
    use Trigger::*;

    match (from, trigger) {
        (Pending, CodeVerified) => Some(Active),
        (Pending, TwoFactorRequired) => Some(Pending2fa),
        (Pending2fa, TwoFactorAccepted) => Some(Active),
        (Active, CheckNotAuthorized) => Some(Dead),
        (Active, CheckRateLimited) => Some(Flood),
        (Dead, CheckSucceeded) | (Flood, CheckSucceeded) => Some(Active),
        (Active, ReclaimCompleted) => Some(Reclaimed),
        (Active, ReauthorizationRequested) => Some(PendingReauthorization),
        (PendingReauthorization, ReauthorizationVerified)
        | (Dead, ReauthorizationVerified)
        | (Flood, ReauthorizationVerified) => Some(Active),
        (Active, Suspend) => Some(Suspended),
        _ => None,
    }
}

pub fn transition(from: AccountStatus, trigger: Trigger) -> Result<AccountStatus> {
    next_status(from, trigger).ok_or(CustodianError::InvalidTransition { from, trigger })
}
