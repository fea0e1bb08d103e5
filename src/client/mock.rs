// Scripted in-memory platform for workflow tests
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{ClientFactory, ClientParams, PlatformError, ServiceMessage, SessionClient, SignIn};

#[derive(Default)]
pub struct MockState {
    pub authorized: bool,
    pub connect_errors: VecDeque<PlatformError>,
    pub authorized_error: Option<PlatformError>,
    pub correlation_token: String,
    pub request_code_error: Option<PlatformError>,
    pub sign_in_results: VecDeque<Result<Vec<u8>, PlatformError>>,
    pub edit_password_results: VecDeque<Result<(), PlatformError>>,
    pub reset_error: Option<PlatformError>,
    pub log_out_error: Option<PlatformError>,
    pub service_messages: Vec<ServiceMessage>,
    pub messages_error: Option<PlatformError>,
    pub dialogs: usize,
    pub exported_session: Vec<u8>,
    pub calls: Vec<String>,
    pub built: Vec<ClientParams>,
}

#[derive(Clone, Default)]
pub struct MockPlatform {
    pub state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn authorized() -> Self {
        let platform = Self::default();
        {
            let mut state = platform.state.lock().unwrap();
            state.authorized = true;
            state.correlation_token = "corr-token".to_string();
            state.exported_session = b"partial-session".to_vec();
            state.dialogs = 7;
        }
        platform
    }

    pub fn with<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn built(&self) -> Vec<ClientParams> {
        self.state.lock().unwrap().built.clone()
    }
}

impl ClientFactory for MockPlatform {
    fn build(&self, params: ClientParams) -> Result<Box<dyn SessionClient>, PlatformError> {
        self.state.lock().unwrap().built.push(params);
        Ok(Box::new(MockClient { state: self.state.clone() }))
    }
}

pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        state
    }
}

fn fail(err: &Option<PlatformError>) -> Result<(), PlatformError> {
    match err {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    }
}

#[async_trait]
impl SessionClient for MockClient {
    async fn connect(&self) -> Result<(), PlatformError> {
        let mut state = self.record("connect");
        match state.connect_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        self.record("disconnect");
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, PlatformError> {
        let state = self.record("is_authorized");
        fail(&state.authorized_error)?;
        Ok(state.authorized)
    }

    async fn request_code(&self, _phone: &str) -> Result<String, PlatformError> {
        let state = self.record("request_code");
        fail(&state.request_code_error)?;
        Ok(state.correlation_token.clone())
    }

    async fn sign_in(&self, credential: SignIn) -> Result<Vec<u8>, PlatformError> {
        let call = match credential {
            SignIn::Code { .. } => "sign_in_code",
            SignIn::Password(_) => "sign_in_password",
        };
        let mut state = self.record(call);
        state
            .sign_in_results
            .pop_front()
            .unwrap_or_else(|| Ok(b"authorized-session".to_vec()))
    }

    async fn edit_password(&self, current: Option<&str>, _new: &str) -> Result<(), PlatformError> {
        let call = if current.map_or(true, str::is_empty) {
            "edit_password_empty"
        } else {
            "edit_password"
        };
        let mut state = self.record(call);
        state.edit_password_results.pop_front().unwrap_or(Ok(()))
    }

    async fn reset_all_authorizations(&self) -> Result<(), PlatformError> {
        let state = self.record("reset_all_authorizations");
        fail(&state.reset_error)
    }

    async fn log_out(&self) -> Result<(), PlatformError> {
        let state = self.record("log_out");
        fail(&state.log_out_error)
    }

    async fn recent_service_messages(&self, limit: usize) -> Result<Vec<ServiceMessage>, PlatformError> {
        let state = self.record("recent_service_messages");
        fail(&state.messages_error)?;
        Ok(state.service_messages.iter().take(limit).cloned().collect())
    }

    async fn list_dialogs(&self, limit: usize) -> Result<usize, PlatformError> {
        let state = self.record("list_dialogs");
        Ok(state.dialogs.min(limit))
    }

    async fn export_session(&self) -> Result<Vec<u8>, PlatformError> {
        let state = self.record("export_session");
        Ok(state.exported_session.clone())
    }
}
