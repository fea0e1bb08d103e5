use thiserror::Error;

use crate::account::types::AccountStatus;
use crate::account::state::Trigger;
use crate::vault::VaultError;

#[derive(Error, Debug)]
pub enum CustodianError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Integrity error: {0}")]
    Integrity(#[from] VaultError),
    #[error("Account {0} not found")]
    AccountNotFound(String),
    #[error("Transition {trigger:?} is not allowed from status {from}")]
    InvalidTransition { from: AccountStatus, trigger: Trigger },
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<sled::Error> for CustodianError {
    fn from(err: sled::Error) -> Self {
        CustodianError::DatabaseError(err.to_string())
    }
}

impl From<bincode::Error> for CustodianError {
    fn from(err: bincode::Error) -> Self {
        CustodianError::DeserializationError(err.to_string())
    }
}

impl From<serde_json::Error> for CustodianError {
    fn from(err: serde_json::Error) -> Self {
        CustodianError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CustodianError>;
