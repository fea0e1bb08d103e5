//! Session Store: encrypted account persistence
//!
//! Every secret field is encrypted on its own with a fresh nonce. The raw
//! session blob is hashed before encryption and the hash re-checked on load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state::{transition, Trigger};
use super::types::{Account, AccountSecrets, AccountStatus, ActivityStatus, DeviceParams, SecurityAlert};
use crate::audit::{Actor, AuditAction, AuditLog};
use crate::error::{CustodianError, Result};
use crate::storage::{Storage, ACCOUNTS_TREE};
use crate::vault::{CredentialBundle, Vault};

/// Hex SHA-256 of a raw session blob.
pub fn session_hash(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// Plaintext input to [`SessionStore::save`].
#[derive(Clone, Debug)]
pub struct SessionFields {
    pub phone: String,
    pub employee_id: Option<String>,
    pub employee_name: Option<String>,
    pub note: Option<String>,
    pub api_id: String,
    pub api_hash: String,
    /// Empty when no authorized session exists yet.
    pub session: Vec<u8>,
    pub recovery_email: String,
    pub status: AccountStatus,
    pub two_factor_enabled: bool,
    pub device: DeviceParams,
    pub proxy: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionIntegrity {
    Verified,
    /// Stored hash disagrees with the decrypted blob. The blob is still returned.
    Mismatch,
    Absent,
}

/// Decrypted account. Lives only for the duration of a workflow step.
#[derive(Clone)]
pub struct SessionView {
    pub account: Account,
    pub api_id: String,
    pub api_hash: String,
    pub session: Option<Vec<u8>>,
    pub recovery_email: String,
    pub integrity: SessionIntegrity,
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("phone", &self.account.phone)
            .field("status", &self.account.status)
            .field("has_session", &self.session.is_some())
            .field("integrity", &self.integrity)
            .finish()
    }
}

/// Login in progress: the platform's code correlation token plus the
/// session material of the client that requested it.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub correlation_token: String,
    pub session: Vec<u8>,
}

impl std::fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingLogin({} byte session)", self.session.len())
    }
}

#[derive(Clone)]
pub struct SessionStore {
    vault: Arc<Vault>,
}

impl SessionStore {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    pub fn find(&self, storage: &Storage, phone: &str) -> Result<Option<Account>> {
        storage.get(ACCOUNTS_TREE, phone)
    }

    pub fn account(&self, storage: &Storage, phone: &str) -> Result<Account> {
        self.find(storage, phone)?
            .ok_or_else(|| CustodianError::AccountNotFound(phone.to_string()))
    }

    pub fn list(&self, storage: &Storage) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = storage.values(ACCOUNTS_TREE)?;
        accounts.sort_by(|a, b| a.phone.cmp(&b.phone));
        Ok(accounts)
    }

    pub fn list_by_status(&self, storage: &Storage, status: AccountStatus) -> Result<Vec<Account>> {
        Ok(self
            .list(storage)?
            .into_iter()
            .filter(|a| a.status == status)
            .collect())
    }

    /// Persist non-secret changes to an already loaded record.
    pub fn put(&self, storage: &Storage, account: &mut Account) -> Result<()> {
        account.updated_at = Utc::now();
        storage.put(ACCOUNTS_TREE, &account.phone, account)
    }

    /// Idempotent upsert. On conflict the identity, API credentials, session
    /// and recovery email are overwritten, any pending login is dropped, and
    /// activity is forced to healthy. Alert history and the custodied cloud
    /// password are kept: the password lives on the platform account, not in
    /// the session being replaced.
    pub fn save(&self, storage: &Storage, fields: SessionFields, actor: &Actor) -> Result<Account> {
        let now = Utc::now();
        let secrets = AccountSecrets {
            api_id: self.vault.encrypt_str(&fields.api_id)?,
            api_hash: self.vault.encrypt_str(&fields.api_hash)?,
            session: self.vault.encrypt(&fields.session)?,
            recovery_email: self.vault.encrypt_str(&fields.recovery_email)?,
            code_token: None,
            cloud_password: None,
        };

        let existing = self.find(storage, &fields.phone)?;
        let is_update = existing.is_some();
        let mut account = match existing {
            Some(mut account) => {
                account.secrets.api_id = secrets.api_id;
                account.secrets.api_hash = secrets.api_hash;
                account.secrets.session = secrets.session;
                account.secrets.recovery_email = secrets.recovery_email;
                account.secrets.code_token = None;
                account.status = fields.status;
                account
            }
            None => Account::new(fields.phone.clone(), secrets, fields.status, now),
        };

        account.employee_id = fields.employee_id;
        account.employee_name = fields.employee_name;
        account.note = fields.note;
        account.two_factor_enabled = fields.two_factor_enabled || account.secrets.cloud_password.is_some();
        account.device = fields.device;
        account.proxy = fields.proxy;
        account.activity = ActivityStatus::Healthy;
        if fields.session.is_empty() {
            account.session_hash.clear();
            account.session_updated_at = None;
        } else {
            account.session_hash = session_hash(&fields.session);
            account.session_updated_at = Some(now);
        }
        self.put(storage, &mut account)?;

        let action = if is_update { AuditAction::SessionUpdated } else { AuditAction::SessionSaved };
        AuditLog::append(
            storage,
            &account.phone,
            action,
            json!({ "status": account.status.as_str(), "has_session": account.has_session() }),
            actor,
        )?;
        info!("Session record {} for {}", action, account.phone);
        Ok(account)
    }

    /// Decrypts every secret field. A session hash mismatch is reported in
    /// [`SessionView::integrity`] and logged, but the data is still returned.
    pub fn load(&self, storage: &Storage, phone: &str) -> Result<SessionView> {
        let account = self.account(storage, phone)?;
        let blob = self.vault.decrypt(&account.secrets.session)?;

        let (session, integrity) = if blob.is_empty() {
            if account.session_hash.is_empty() {
                (None, SessionIntegrity::Absent)
            } else {
                warn!("Session hash mismatch for {}: stored hash but empty session blob", phone);
                (None, SessionIntegrity::Mismatch)
            }
        } else {
            let actual = session_hash(&blob);
            if actual == account.session_hash {
                (Some(blob), SessionIntegrity::Verified)
            } else {
                warn!(
                    "Session hash mismatch for {}: stored {} computed {}",
                    phone,
                    prefix(&account.session_hash),
                    prefix(&actual)
                );
                (Some(blob), SessionIntegrity::Mismatch)
            }
        };

        Ok(SessionView {
            api_id: self.vault.decrypt_string(&account.secrets.api_id)?,
            api_hash: self.vault.decrypt_string(&account.secrets.api_hash)?,
            recovery_email: self.vault.decrypt_string(&account.secrets.recovery_email)?,
            session,
            integrity,
            account,
        })
    }

    /// Replace only the session blob. Clears the pending login and resets the
    /// account to active/healthy.
    pub fn update_session(&self, storage: &Storage, phone: &str, blob: &[u8], actor: &Actor) -> Result<Account> {
        let mut account = self.account(storage, phone)?;
        let now = Utc::now();
        account.secrets.session = self.vault.encrypt(blob)?;
        account.session_hash = session_hash(blob);
        account.session_updated_at = Some(now);
        account.secrets.code_token = None;
        account.status = AccountStatus::Active;
        account.activity = ActivityStatus::Healthy;
        account.last_ping = Some(now);
        self.put(storage, &mut account)?;

        AuditLog::append(
            storage,
            phone,
            AuditAction::SessionUpdated,
            json!({ "session_hash": prefix(&account.session_hash) }),
            actor,
        )?;
        debug!("Session replaced for {} ({} bytes)", phone, blob.len());
        Ok(account)
    }

    /// Soft delete: the record stays, the session becomes an empty bundle.
    pub fn delete_session(&self, storage: &Storage, phone: &str, actor: &Actor) -> Result<Account> {
        let mut account = self.account(storage, phone)?;
        account.secrets.session = self.vault.encrypt(b"")?;
        account.session_hash.clear();
        account.session_updated_at = Some(Utc::now());
        account.secrets.code_token = None;
        account.activity = ActivityStatus::Unreachable;
        self.put(storage, &mut account)?;

        AuditLog::append(storage, phone, AuditAction::SessionDeleted, json!({}), actor)?;
        info!("Session deleted for {}", phone);
        Ok(account)
    }

    pub fn set_code_token(&self, storage: &Storage, phone: &str, pending: &PendingLogin) -> Result<()> {
        let mut account = self.account(storage, phone)?;
        let raw = serde_json::to_vec(pending)?;
        account.secrets.code_token = Some(self.vault.encrypt(&raw)?);
        self.put(storage, &mut account)
    }

    pub fn get_code_token(&self, storage: &Storage, phone: &str) -> Result<Option<PendingLogin>> {
        let account = self.account(storage, phone)?;
        self.decrypt_code_token(account.secrets.code_token.as_ref())
    }

    pub fn clear_code_token(&self, storage: &Storage, phone: &str) -> Result<()> {
        let mut account = self.account(storage, phone)?;
        if account.secrets.code_token.take().is_some() {
            self.put(storage, &mut account)?;
        }
        Ok(())
    }

    fn decrypt_code_token(&self, bundle: Option<&CredentialBundle>) -> Result<Option<PendingLogin>> {
        match bundle {
            Some(bundle) => {
                let raw = self.vault.decrypt(bundle)?;
                let pending = serde_json::from_slice(&raw)
                    .map_err(|e| CustodianError::DeserializationError(e.to_string()))?;
                Ok(Some(pending))
            }
            None => Ok(None),
        }
    }

    /// Keep a password this system set on the platform account.
    pub fn store_cloud_password(&self, storage: &Storage, phone: &str, password: &str) -> Result<()> {
        let mut account = self.account(storage, phone)?;
        account.secrets.cloud_password = Some(self.vault.encrypt_str(password)?);
        account.two_factor_enabled = true;
        self.put(storage, &mut account)
    }

    pub fn cloud_password(&self, storage: &Storage, phone: &str) -> Result<Option<String>> {
        let account = self.account(storage, phone)?;
        match account.secrets.cloud_password {
            Some(bundle) => Ok(Some(self.vault.decrypt_string(&bundle)?)),
            None => Ok(None),
        }
    }

    /// Run a state machine trigger against the stored record.
    pub fn apply_trigger(&self, storage: &Storage, phone: &str, trigger: Trigger) -> Result<Account> {
        let mut account = self.account(storage, phone)?;
        let from = account.status;
        account.status = transition(from, trigger)?;
        self.put(storage, &mut account)?;
        info!("{}: {} -> {} ({:?})", phone, from, account.status, trigger);
        Ok(account)
    }

    pub fn record_alert(&self, storage: &Storage, phone: &str, alert: SecurityAlert) -> Result<Account> {
        let mut account = self.account(storage, phone)?;
        warn!("Security alert for {}: {}", phone, alert.message);
        account.security.record(alert);
        self.put(storage, &mut account)?;
        Ok(account)
    }
}

fn prefix(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::{AlertContext, SessionLossKind};
    use crate::audit::AuditAction;

    fn setup() -> (Storage, SessionStore, Arc<Vault>) {
        let vault = Arc::new(Vault::from_config_key("store-test-key"));
        (Storage::temporary().unwrap(), SessionStore::new(vault.clone()), vault)
    }

    fn fields(phone: &str, session: &[u8]) -> SessionFields {
        SessionFields {
            phone: phone.to_string(),
            employee_id: Some("E-17".to_string()),
            employee_name: Some("Dana Smith".to_string()),
            note: None,
            api_id: "12345".to_string(),
            api_hash: "0123456789abcdef".to_string(),
            session: session.to_vec(),
            recovery_email: "recovery@corp.example".to_string(),
            status: AccountStatus::Active,
            two_factor_enabled: false,
            device: DeviceParams::default(),
            proxy: None,
        }
    }

    #[test]
    fn test_load_after_save_verifies_hash() {
        let (storage, store, _) = setup();
        let actor = Actor::new("tester");
        let saved = store.save(&storage, fields("+7001", b"session-blob"), &actor).unwrap();
        assert_eq!(saved.session_hash, session_hash(b"session-blob"));

        let view = store.load(&storage, "+7001").unwrap();
        assert_eq!(view.session.as_deref(), Some(&b"session-blob"[..]));
        assert_eq!(view.integrity, SessionIntegrity::Verified);
        assert_eq!(view.account.session_hash, session_hash(b"session-blob"));
        assert_eq!(view.api_hash, "0123456789abcdef");
        assert_eq!(view.recovery_email, "recovery@corp.example");
    }

    #[test]
    fn test_secret_fields_use_independent_nonces() {
        let (storage, store, _) = setup();
        let account = store.save(&storage, fields("+7002", b"blob"), &Actor::system()).unwrap();
        let s = &account.secrets;
        let nonces = [&s.api_id.nonce, &s.api_hash.nonce, &s.session.nonce, &s.recovery_email.nonce];
        for (i, a) in nonces.iter().enumerate() {
            for b in nonces.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_tampered_blob_is_flagged_but_returned() {
        let (storage, store, vault) = setup();
        store.save(&storage, fields("+7003", b"original"), &Actor::system()).unwrap();

        let mut account = store.account(&storage, "+7003").unwrap();
        account.secrets.session = vault.encrypt(b"tampered").unwrap();
        storage.put(ACCOUNTS_TREE, "+7003", &account).unwrap();

        let view = store.load(&storage, "+7003").unwrap();
        assert_eq!(view.integrity, SessionIntegrity::Mismatch);
        assert_eq!(view.session.as_deref(), Some(&b"tampered"[..]));
    }

    #[test]
    fn test_tag_tamper_is_hard_failure() {
        let (storage, store, _) = setup();
        store.save(&storage, fields("+7004", b"blob"), &Actor::system()).unwrap();
        let mut account = store.account(&storage, "+7004").unwrap();
        account.secrets.api_hash.tag = account.secrets.api_id.tag.clone();
        storage.put(ACCOUNTS_TREE, "+7004", &account).unwrap();

        assert!(matches!(store.load(&storage, "+7004"), Err(CustodianError::Integrity(_))));
    }

    #[test]
    fn test_upsert_overwrites_secrets_and_forces_healthy() {
        let (storage, store, _) = setup();
        let actor = Actor::system();
        store.save(&storage, fields("+7005", b"first"), &actor).unwrap();
        let mut account = store.account(&storage, "+7005").unwrap();
        account.activity = ActivityStatus::Unreachable;
        account.security.record(SecurityAlert::manager_session_lost(SessionLossKind::Old, Utc::now()));
        store.put(&storage, &mut account).unwrap();

        let mut again = fields("+7005", b"second");
        again.api_hash = "fedcba".to_string();
        let account = store.save(&storage, again, &actor).unwrap();
        assert_eq!(account.activity, ActivityStatus::Healthy);
        assert_eq!(account.security.history.len(), 1);

        let view = store.load(&storage, "+7005").unwrap();
        assert_eq!(view.api_hash, "fedcba");
        assert_eq!(view.session.as_deref(), Some(&b"second"[..]));
        assert_eq!(store.list(&storage).unwrap().len(), 1);
        assert_eq!(AuditLog::count(&storage, "+7005", AuditAction::SessionSaved).unwrap(), 1);
        assert_eq!(AuditLog::count(&storage, "+7005", AuditAction::SessionUpdated).unwrap(), 1);
    }

    #[test]
    fn test_upsert_keeps_cloud_password_and_drops_pending_login() {
        let (storage, store, _) = setup();
        let actor = Actor::system();
        store.save(&storage, fields("+7010", b"first"), &actor).unwrap();
        store.store_cloud_password(&storage, "+7010", "Kept!Pass1").unwrap();
        store
            .set_code_token(&storage, "+7010", &PendingLogin { correlation_token: "old".into(), session: vec![1] })
            .unwrap();

        let account = store.save(&storage, fields("+7010", b"second"), &actor).unwrap();
        assert!(account.two_factor_enabled);
        assert_eq!(store.cloud_password(&storage, "+7010").unwrap().as_deref(), Some("Kept!Pass1"));
        assert!(store.get_code_token(&storage, "+7010").unwrap().is_none());
    }

    #[test]
    fn test_delete_session_is_soft() {
        let (storage, store, _) = setup();
        store.save(&storage, fields("+7006", b"blob"), &Actor::system()).unwrap();
        store
            .set_code_token(&storage, "+7006", &PendingLogin { correlation_token: "tok".into(), session: vec![1] })
            .unwrap();

        let account = store.delete_session(&storage, "+7006", &Actor::system()).unwrap();
        assert_eq!(account.activity, ActivityStatus::Unreachable);
        assert!(!account.has_session());
        assert!(account.secrets.code_token.is_none());

        let view = store.load(&storage, "+7006").unwrap();
        assert!(view.session.is_none());
        assert_eq!(view.integrity, SessionIntegrity::Absent);
    }

    #[test]
    fn test_update_session_clears_token_and_activates() {
        let (storage, store, _) = setup();
        let mut f = fields("+7007", b"");
        f.status = AccountStatus::Pending;
        store.save(&storage, f, &Actor::system()).unwrap();
        let pending = PendingLogin { correlation_token: "hash".into(), session: b"partial".to_vec() };
        store.set_code_token(&storage, "+7007", &pending).unwrap();
        assert_eq!(store.get_code_token(&storage, "+7007").unwrap(), Some(pending));

        let account = store.update_session(&storage, "+7007", b"authorized", &Actor::system()).unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.activity, ActivityStatus::Healthy);
        assert!(store.get_code_token(&storage, "+7007").unwrap().is_none());
        assert_eq!(store.load(&storage, "+7007").unwrap().integrity, SessionIntegrity::Verified);
    }

    #[test]
    fn test_apply_trigger_rejects_invalid_pair() {
        let (storage, store, _) = setup();
        store.save(&storage, fields("+7008", b"blob"), &Actor::system()).unwrap();
        assert!(store.apply_trigger(&storage, "+7008", Trigger::CodeVerified).is_err());
        assert_eq!(store.account(&storage, "+7008").unwrap().status, AccountStatus::Active);

        let account = store.apply_trigger(&storage, "+7008", Trigger::CheckNotAuthorized).unwrap();
        assert_eq!(account.status, AccountStatus::Dead);
    }

    #[test]
    fn test_cloud_password_custody_and_alerts() {
        let (storage, store, _) = setup();
        store.save(&storage, fields("+7009", b"blob"), &Actor::system()).unwrap();
        assert_eq!(store.cloud_password(&storage, "+7009").unwrap(), None);
        store.store_cloud_password(&storage, "+7009", "N3w!Passw0rd").unwrap();
        assert_eq!(store.cloud_password(&storage, "+7009").unwrap().as_deref(), Some("N3w!Passw0rd"));
        assert!(store.account(&storage, "+7009").unwrap().two_factor_enabled);

        let alert = SecurityAlert::new("Login code: 12345", AlertContext::PlatformNotice, Utc::now());
        let account = store.record_alert(&storage, "+7009", alert).unwrap();
        assert_eq!(account.security.alert_message(), Some("Login code: 12345"));
    }

    #[test]
    fn test_missing_account() {
        let (storage, store, _) = setup();
        assert!(matches!(store.load(&storage, "+0"), Err(CustodianError::AccountNotFound(_))));
    }
}
