use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::account::types::DeviceParams;
use crate::error::CustodianError;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CustodianConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./data/custodian".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VaultConfig {
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
    /// Inline key for development setups. The environment variable wins when both are set.
    #[serde(default)]
    pub master_key: Option<String>,
}

fn default_master_key_env() -> String {
    "CUSTODIAN_ENCRYPTION_KEY".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
            master_key: None,
        }
    }
}

impl VaultConfig {
    pub fn resolve_master_key(&self) -> Result<String, CustodianError> {
        if let Ok(key) = std::env::var(&self.master_key_env) {
            if !key.is_empty() {
                return Ok(key);
            }
        }
        match &self.master_key {
            Some(key) if !key.is_empty() => {
                warn!("Using inline master key from config file; set {} in production", self.master_key_env);
                Ok(key.clone())
            }
            _ => Err(CustodianError::Config(format!(
                "master key missing: set {} or [vault] master_key",
                self.master_key_env
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlatformConfig {
    #[serde(default)]
    pub api_id: i64,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub device: DeviceParams,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8787/rpc".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            bridge_url: default_bridge_url(),
            request_timeout_secs: default_request_timeout(),
            device: DeviceParams::default(),
        }
    }
}

impl PlatformConfig {
    /// Application credentials are required before any code can be requested.
    pub fn app_credentials(&self) -> Result<AppCredentials, CustodianError> {
        if self.api_id <= 0 || self.api_hash.trim().is_empty() {
            return Err(CustodianError::Config(
                "[platform] api_id and api_hash must be configured".to_string(),
            ));
        }
        Ok(AppCredentials {
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
        })
    }
}

/// Platform application identity shared by every custodied account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub api_id: i64,
    pub api_hash: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
    Mtproto,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PacingConfig {
    #[serde(default = "default_anti_flood_min")]
    pub anti_flood_min_secs: u64,
    #[serde(default = "default_anti_flood_max")]
    pub anti_flood_max_secs: u64,
    #[serde(default = "default_bulk_min")]
    pub bulk_min_secs: u64,
    #[serde(default = "default_bulk_max")]
    pub bulk_max_secs: u64,
    #[serde(default = "default_step_min")]
    pub step_min_ms: u64,
    #[serde(default = "default_step_max")]
    pub step_max_ms: u64,
    #[serde(default = "default_dialog_limit")]
    pub dialog_limit: usize,
    #[serde(default = "default_service_message_limit")]
    pub service_message_limit: usize,
}

fn default_anti_flood_min() -> u64 {
    5
}
fn default_anti_flood_max() -> u64 {
    15
}
fn default_bulk_min() -> u64 {
    60
}
fn default_bulk_max() -> u64 {
    120
}
fn default_step_min() -> u64 {
    1_000
}
fn default_step_max() -> u64 {
    3_000
}
fn default_dialog_limit() -> usize {
    10
}
fn default_service_message_limit() -> usize {
    20
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            anti_flood_min_secs: default_anti_flood_min(),
            anti_flood_max_secs: default_anti_flood_max(),
            bulk_min_secs: default_bulk_min(),
            bulk_max_secs: default_bulk_max(),
            step_min_ms: default_step_min(),
            step_max_ms: default_step_max(),
            dialog_limit: default_dialog_limit(),
            service_message_limit: default_service_message_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_flood_margin")]
    pub flood_margin_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff() -> u64 {
    2
}
fn default_flood_margin() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff(),
            flood_margin_secs: default_flood_margin(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: default_pool_size() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
    #[serde(default = "default_daily_interval")]
    pub daily_check_interval_hours: u64,
    #[serde(default = "default_retention")]
    pub task_retention_days: i64,
}

fn default_tick() -> u64 {
    30
}
fn default_daily_interval() -> u64 {
    24
}
fn default_retention() -> i64 {
    7
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            daily_check_interval_hours: default_daily_interval(),
            task_retention_days: default_retention(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn daily_interval(&self) -> Duration {
        Duration::from_secs(self.daily_check_interval_hours.max(1) * 3600)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl CustodianConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        info!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        warn!("Error parsing config {}: {}. Using defaults.", path, e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("Error reading config {}: {}. Using defaults.", path, e);
                    Self::default()
                }
            }
        } else {
            info!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                if let Err(e) = std::fs::write(path, s) {
                    warn!("Could not write default config to {}: {}", path, e);
                }
            }
            config
        }
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.name == name)
    }
}
