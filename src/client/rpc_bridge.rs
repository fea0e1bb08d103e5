// JSON-RPC bridge to the platform protocol sidecar
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClientFactory, ClientParams, PlatformError, ServiceMessage, SessionClient, SignIn, SERVICE_ACCOUNT_ID};

pub struct RpcBridgeFactory {
    url: String,
    http: Client,
}

impl RpcBridgeFactory {
    pub fn new(url: String, timeout: Duration) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Provider(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { url, http })
    }
}

impl ClientFactory for RpcBridgeFactory {
    fn build(&self, params: ClientParams) -> Result<Box<dyn SessionClient>, PlatformError> {
        Ok(Box::new(RpcBridgeClient {
            url: self.url.clone(),
            http: self.http.clone(),
            request_id: AtomicU64::new(1),
            params,
            handle: Mutex::new(None),
        }))
    }
}

/// One bridge-side client, addressed by the handle returned from `connect`.
pub struct RpcBridgeClient {
    url: String,
    http: Client,
    request_id: AtomicU64,
    params: ClientParams,
    handle: Mutex<Option<String>>,
}

impl RpcBridgeClient {
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, PlatformError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let json: Value = response.json().await.map_err(map_transport_error)?;

        if let Some(error) = json.get("error") {
            let err = map_bridge_error(error);
            debug!("bridge {} for {} failed: {}", method, self.params.phone, err);
            return Err(err);
        }

        Ok(json["result"].clone())
    }

    /// Calls that act on an open client carry its handle.
    async fn call(&self, method: &str, mut params: Value) -> Result<Value, PlatformError> {
        let handle = self
            .handle
            .lock()
            .await
            .clone()
            .ok_or_else(|| PlatformError::Network("client is not connected".to_string()))?;
        params["handle"] = json!(handle);
        self.send_request(method, params).await
    }
}

#[async_trait]
impl SessionClient for RpcBridgeClient {
    async fn connect(&self) -> Result<(), PlatformError> {
        let p = &self.params;
        let res = self
            .send_request(
                "connect",
                json!({
                    "api_id": p.api_id,
                    "api_hash": p.api_hash,
                    "session": p.session.as_ref().map(|s| STANDARD.encode(s)),
                    "device": p.device,
                    "proxy": p.proxy,
                }),
            )
            .await?;
        let handle = res["handle"]
            .as_str()
            .ok_or_else(|| PlatformError::Provider("connect returned no handle".to_string()))?
            .to_string();
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        let taken = self.handle.lock().await.take();
        if let Some(handle) = taken {
            self.send_request("disconnect", json!({ "handle": handle })).await?;
        }
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, PlatformError> {
        let res = self.call("isAuthorized", json!({})).await?;
        parse_authorized(&res)
    }

    async fn request_code(&self, phone: &str) -> Result<String, PlatformError> {
        let res = self.call("sendCode", json!({ "phone": phone })).await?;
        res["correlation_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Provider("sendCode returned no correlation token".to_string()))
    }

    async fn sign_in(&self, credential: SignIn) -> Result<Vec<u8>, PlatformError> {
        let params = match credential {
            SignIn::Code { phone, code, correlation_token } => json!({
                "phone": phone,
                "code": code,
                "correlation_token": correlation_token,
            }),
            SignIn::Password(password) => json!({ "password": password }),
        };
        let res = self.call("signIn", params).await?;
        decode_session(&res)
    }

    async fn edit_password(&self, current: Option<&str>, new: &str) -> Result<(), PlatformError> {
        self.call("editPassword", json!({ "current": current, "new": new })).await?;
        Ok(())
    }

    async fn reset_all_authorizations(&self) -> Result<(), PlatformError> {
        self.call("resetAuthorizations", json!({})).await?;
        Ok(())
    }

    async fn log_out(&self) -> Result<(), PlatformError> {
        self.call("logOut", json!({})).await?;
        Ok(())
    }

    async fn recent_service_messages(&self, limit: usize) -> Result<Vec<ServiceMessage>, PlatformError> {
        // Read-only history fetch; the bridge must not mark anything as read.
        let res = self
            .call("getHistory", json!({ "peer": SERVICE_ACCOUNT_ID, "limit": limit }))
            .await?;
        let items = res.as_array().cloned().unwrap_or_default();
        Ok(items.iter().filter_map(parse_service_message).collect())
    }

    async fn list_dialogs(&self, limit: usize) -> Result<usize, PlatformError> {
        let res = self.call("listDialogs", json!({ "limit": limit })).await?;
        parse_dialog_count(&res)
    }

    async fn export_session(&self) -> Result<Vec<u8>, PlatformError> {
        let res = self.call("exportSession", json!({})).await?;
        decode_session(&res)
    }
}

fn decode_session(res: &Value) -> Result<Vec<u8>, PlatformError> {
    let encoded = res["session"]
        .as_str()
        .ok_or_else(|| PlatformError::Provider("response carried no session".to_string()))?;
    STANDARD
        .decode(encoded)
        .map_err(|e| PlatformError::Provider(format!("session is not base64: {}", e)))
}

/// Anything but a bool is a bridge fault, never "not authorized".
fn parse_authorized(res: &Value) -> Result<bool, PlatformError> {
    res.as_bool()
        .ok_or_else(|| PlatformError::Provider(format!("malformed isAuthorized reply: {}", res)))
}

fn parse_dialog_count(res: &Value) -> Result<usize, PlatformError> {
    res["count"]
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| PlatformError::Provider(format!("malformed listDialogs reply: {}", res)))
}

fn parse_service_message(item: &Value) -> Option<ServiceMessage> {
    let text = item["text"].as_str()?.to_string();
    let posted_at = DateTime::<Utc>::from_timestamp(item["date"].as_i64()?, 0)?;
    Some(ServiceMessage { text, posted_at })
}

fn map_transport_error(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout
    } else {
        PlatformError::Network(err.to_string())
    }
}

/// Map a JSON-RPC error object onto the adapter taxonomy. The bridge reports
/// the platform's own error name in `data.kind`.
pub fn map_bridge_error(error: &Value) -> PlatformError {
    let message = error["message"].as_str().unwrap_or("Unknown error").to_string();
    let kind = error["data"]["kind"].as_str().unwrap_or("");
    match kind {
        "FLOOD_WAIT" => PlatformError::FloodWait {
            seconds: error["data"]["seconds"].as_u64().unwrap_or(0),
        },
        "AUTH_KEY_UNREGISTERED" => PlatformError::Unauthorized,
        "AUTH_KEY_INVALID" | "SESSION_REVOKED" | "SESSION_EXPIRED" | "USER_DEACTIVATED" => {
            PlatformError::AuthKeyInvalid
        }
        "SESSION_PASSWORD_NEEDED" => PlatformError::PasswordRequired,
        "PASSWORD_HASH_INVALID" => PlatformError::PasswordHashInvalid,
        "PHONE_CODE_INVALID" | "PHONE_CODE_EMPTY" => PlatformError::CodeInvalid,
        "PHONE_CODE_EXPIRED" => PlatformError::CodeExpired,
        "PHONE_NUMBER_UNOCCUPIED" | "PHONE_NUMBER_INVALID" => PlatformError::PhoneUnregistered,
        "API_ID_INVALID" => PlatformError::ApiIdInvalid,
        "TIMEOUT" => PlatformError::Timeout,
        "NETWORK" => PlatformError::Network(message),
        _ => PlatformError::Provider(message),
    }
}
