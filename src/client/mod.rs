//! External session client adapter
//!
//! The orchestrator drives the messaging platform only through
//! [`SessionClient`]. Concrete clients are built per workflow step by a
//! [`ClientFactory`] from decrypted account material.

pub mod rpc_bridge;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::types::DeviceParams;
use crate::config::ProxyConfig;

pub use rpc_bridge::{RpcBridgeClient, RpcBridgeFactory};

/// Sender id of the platform's official service notifications.
pub const SERVICE_ACCOUNT_ID: i64 = 777000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited for {seconds}s")]
    FloodWait { seconds: u64 },
    #[error("authorization key is invalid or revoked")]
    AuthKeyInvalid,
    #[error("session is not authorized")]
    Unauthorized,
    #[error("two-factor password required")]
    PasswordRequired,
    #[error("password is incorrect")]
    PasswordHashInvalid,
    #[error("verification code is invalid")]
    CodeInvalid,
    #[error("verification code has expired")]
    CodeExpired,
    #[error("phone number is not registered")]
    PhoneUnregistered,
    #[error("application credentials rejected")]
    ApiIdInvalid,
    #[error("provider error: {0}")]
    Provider(String),
}

/// Coarse error taxonomy the orchestrator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    RateLimited,
    AuthExpired,
    InvalidCredentials,
    TwoFactorRequired,
    CodeInvalid,
    CodeExpired,
    PhoneUnregistered,
    Provider,
}

impl PlatformError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::Network(_) | PlatformError::Timeout => ErrorClass::Transient,
            PlatformError::FloodWait { .. } => ErrorClass::RateLimited,
            PlatformError::AuthKeyInvalid | PlatformError::Unauthorized => ErrorClass::AuthExpired,
            PlatformError::PasswordRequired => ErrorClass::TwoFactorRequired,
            PlatformError::PasswordHashInvalid | PlatformError::ApiIdInvalid => {
                ErrorClass::InvalidCredentials
            }
            PlatformError::CodeInvalid => ErrorClass::CodeInvalid,
            PlatformError::CodeExpired => ErrorClass::CodeExpired,
            PlatformError::PhoneUnregistered => ErrorClass::PhoneUnregistered,
            PlatformError::Provider(_) => ErrorClass::Provider,
        }
    }

    pub fn flood_wait(&self) -> Option<u64> {
        match self {
            PlatformError::FloodWait { seconds } => Some(*seconds),
            _ => None,
        }
    }
}

/// One notification from the official service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// Sign-in credential: a one-time code or the 2FA password, never both.
#[derive(Clone, PartialEq, Eq)]
pub enum SignIn {
    Code {
        phone: String,
        code: String,
        correlation_token: String,
    },
    Password(String),
}

impl std::fmt::Debug for SignIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignIn::Code { phone, .. } => write!(f, "SignIn::Code({})", phone),
            SignIn::Password(_) => f.write_str("SignIn::Password(..)"),
        }
    }
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn connect(&self) -> Result<(), PlatformError>;
    async fn disconnect(&self) -> Result<(), PlatformError>;
    async fn is_authorized(&self) -> Result<bool, PlatformError>;
    /// Returns the correlation token for the code just sent.
    async fn request_code(&self, phone: &str) -> Result<String, PlatformError>;
    /// Returns the authorized session blob.
    async fn sign_in(&self, credential: SignIn) -> Result<Vec<u8>, PlatformError>;
    async fn edit_password(&self, current: Option<&str>, new: &str) -> Result<(), PlatformError>;
    async fn reset_all_authorizations(&self) -> Result<(), PlatformError>;
    async fn log_out(&self) -> Result<(), PlatformError>;
    async fn recent_service_messages(&self, limit: usize) -> Result<Vec<ServiceMessage>, PlatformError>;
    async fn list_dialogs(&self, limit: usize) -> Result<usize, PlatformError>;
    /// Current session material, authorized or not.
    async fn export_session(&self) -> Result<Vec<u8>, PlatformError>;
}

/// Everything needed to open one client for one account.
#[derive(Clone)]
pub struct ClientParams {
    pub phone: String,
    pub api_id: i64,
    pub api_hash: String,
    pub session: Option<Vec<u8>>,
    pub device: DeviceParams,
    pub proxy: Option<ProxyConfig>,
}

impl std::fmt::Debug for ClientParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientParams")
            .field("phone", &self.phone)
            .field("api_id", &self.api_id)
            .field("has_session", &self.session.is_some())
            .field("proxy", &self.proxy.as_ref().map(|p| p.name.as_str()))
            .finish()
    }
}

pub trait ClientFactory: Send + Sync {
    fn build(&self, params: ClientParams) -> Result<Box<dyn SessionClient>, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(PlatformError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(PlatformError::Network("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(PlatformError::FloodWait { seconds: 30 }.class(), ErrorClass::RateLimited);
        assert_eq!(PlatformError::FloodWait { seconds: 30 }.flood_wait(), Some(30));
        assert_eq!(PlatformError::Unauthorized.class(), ErrorClass::AuthExpired);
        assert_eq!(PlatformError::PasswordRequired.class(), ErrorClass::TwoFactorRequired);
        assert_eq!(PlatformError::PasswordHashInvalid.class(), ErrorClass::InvalidCredentials);
        assert_eq!(PlatformError::Provider("x".into()).flood_wait(), None);
    }

    #[test]
    fn test_sign_in_debug_hides_secrets() {
        let code = SignIn::Code {
            phone: "+1555".into(),
            code: "12345".into(),
            correlation_token: "secret-hash".into(),
        };
        let printed = format!("{:?} {:?}", code, SignIn::Password("hunter2".into()));
        assert!(!printed.contains("12345"));
        assert!(!printed.contains("secret-hash"));
        assert!(!printed.contains("hunter2"));
    }
}
