//! Custodied accounts
//!
//! - Record types and the bounded alert history
//! - Lifecycle state machine
//! - Encrypted session persistence

pub mod password;
pub mod state;
pub mod store;
pub mod types;

pub use state::{transition, Trigger};
pub use store::{PendingLogin, SessionFields, SessionIntegrity, SessionStore, SessionView};
pub use types::{
    Account, AccountDetails, AccountStatus, ActivityStatus, AlertContext, DeviceParams, HealthIndicator, Phone,
    SecurityAlert, SessionLossKind,
};
