//! In-process fake of the auth server and a protected API, for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::api::{ApiRequest, ApiResponse, HttpTransport};
use crate::config::Config;

use super::notify::{ChannelNotifier, Notice};
use super::{CredentialKey, MemoryStore, SessionManager};

const BASE_URL: &str = "http://fake.test/api";

#[derive(Default)]
struct FakeState {
    users: HashMap<String, String>,
    valid_access: HashSet<String>,
    retired_refresh: HashSet<String>,
    issued: u32,
    calls: HashMap<&'static str, usize>,
    last_login: Option<(String, String)>,
    last_bearer: Option<String>,
    last_refresh_username: Option<String>,
    reject_refresh: bool,
    fail_network: bool,
    fail_refresh_network: bool,
    reject_all_resources: bool,
    rate_limited: u32,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    refresh_delay: Duration,
    rotate_refresh: bool,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn config() -> Config {
        Config {
            api_base_url: BASE_URL.to_string(),
            ..Config::default()
        }
    }

    pub(crate) fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub(crate) fn with_rotation(mut self) -> Self {
        self.rotate_refresh = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_user(&self, username: &str, password: &str) {
        self.state().users.insert(username.to_string(), password.to_string());
    }

    pub(crate) fn accept_access_token(&self, token: &str) {
        self.state().valid_access.insert(token.to_string());
    }

    pub(crate) fn reject_refresh(&self, reject: bool) {
        self.state().reject_refresh = reject;
    }

    pub(crate) fn fail_network(&self, fail: bool) {
        self.state().fail_network = fail;
    }

    pub(crate) fn fail_refresh_network(&self, fail: bool) {
        self.state().fail_refresh_network = fail;
    }

    pub(crate) fn reject_all_resources(&self, reject: bool) {
        self.state().reject_all_resources = reject;
    }

    pub(crate) fn rate_limit_next(&self, count: u32) {
        self.state().rate_limited = count;
    }

    pub(crate) fn calls(&self, endpoint: &str) -> usize {
        self.state().calls.get(endpoint).copied().unwrap_or(0)
    }

    pub(crate) fn last_login_tokens(&self) -> Option<(String, String)> {
        self.state().last_login.clone()
    }

    pub(crate) fn last_bearer(&self) -> Option<String> {
        self.state().last_bearer.clone()
    }

    pub(crate) fn last_refresh_username(&self) -> Option<String> {
        self.state().last_refresh_username.clone()
    }

    pub(crate) fn is_valid_refresh(&self, token: &str) -> bool {
        let state = self.state();
        !state.reject_refresh && !state.retired_refresh.contains(token)
    }

    fn json_response(status: StatusCode, body: Value) -> ApiResponse {
        ApiResponse::new(status, body.to_string())
    }

    fn bearer(request: &ApiRequest) -> Option<String> {
        request
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    fn body(request: &ApiRequest) -> Value {
        request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null)
    }

    fn login(&self, request: &ApiRequest) -> ApiResponse {
        let body = Self::body(request);
        let mut state = self.state();
        let username = body["username"].as_str().unwrap_or_default();
        let password = body["password"].as_str().unwrap_or_default();
        if state.users.get(username).map(String::as_str) != Some(password) {
            return Self::json_response(StatusCode::UNAUTHORIZED, json!({"error": "invalid"}));
        }
        state.issued += 1;
        let access = format!("access-{}", state.issued);
        let refresh = format!("refresh-{}", state.issued);
        state.valid_access.insert(access.clone());
        state.last_login = Some((access.clone(), refresh.clone()));
        Self::json_response(
            StatusCode::OK,
            json!({"accessToken": access, "refreshToken": refresh}),
        )
    }

    fn refresh(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let body = Self::body(request);
        let mut state = self.state();
        if state.fail_refresh_network {
            bail!("connection reset");
        }
        let refresh_token = body["refreshToken"].as_str().unwrap_or_default().to_string();
        state.last_refresh_username = body["username"].as_str().map(str::to_string);
        if state.reject_refresh || state.retired_refresh.contains(&refresh_token) {
            return Ok(Self::json_response(StatusCode::UNAUTHORIZED, json!({"error": "expired"})));
        }
        state.issued += 1;
        let access = format!("access-{}", state.issued);
        state.valid_access.insert(access.clone());
        if self.rotate_refresh {
            state.retired_refresh.insert(refresh_token);
            let rotated = format!("refresh-{}", state.issued);
            return Ok(Self::json_response(
                StatusCode::OK,
                json!({"accessToken": access, "refreshToken": rotated}),
            ));
        }
        Ok(Self::json_response(StatusCode::OK, json!({"accessToken": access})))
    }

    fn resource(&self, request: &ApiRequest) -> ApiResponse {
        let bearer = Self::bearer(request);
        let mut state = self.state();
        state.last_bearer = bearer.clone();
        if state.rate_limited > 0 {
            state.rate_limited -= 1;
            return ApiResponse::new(StatusCode::TOO_MANY_REQUESTS, "slow down");
        }
        let authorized = bearer.is_some_and(|token| state.valid_access.contains(&token));
        if state.reject_all_resources || !authorized {
            return ApiResponse::new(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        if request.url.ends_with("/missing") {
            return ApiResponse::new(StatusCode::NOT_FOUND, "no such item");
        }
        let id: u64 = request
            .url
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .unwrap_or(0);
        Self::json_response(StatusCode::OK, json!({"id": id}))
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let endpoint = if request.url.ends_with("/auth/login") {
            "login"
        } else if request.url.ends_with("/auth/refresh") {
            "refresh"
        } else if request.url.ends_with("/auth/revoke") {
            "revoke"
        } else {
            "resource"
        };

        {
            let mut state = self.state();
            *state.calls.entry(endpoint).or_insert(0) += 1;
            if state.fail_network {
                bail!("network unreachable");
            }
        }

        match endpoint {
            "login" => Ok(self.login(&request)),
            "refresh" => {
                if !self.refresh_delay.is_zero() {
                    tokio::time::sleep(self.refresh_delay).await;
                }
                self.refresh(&request)
            }
            "revoke" => Ok(ApiResponse::new(StatusCode::NO_CONTENT, Vec::new())),
            _ => Ok(self.resource(&request)),
        }
    }
}

/// Store holding a restorable session for "alice"
pub(crate) fn authenticated_store(access_token: &str, refresh_token: &str) -> MemoryStore {
    MemoryStore::with_values([
        (CredentialKey::Username, "alice"),
        (CredentialKey::AccessToken, access_token),
        (CredentialKey::RefreshToken, refresh_token),
    ])
}

pub(crate) fn harness(
    backend: Arc<FakeBackend>,
    store: MemoryStore,
) -> (SessionManager, Arc<MemoryStore>, mpsc::UnboundedReceiver<Notice>) {
    let store = Arc::new(store);
    let (notifier, notices) = ChannelNotifier::new();
    let manager = SessionManager::new(
        store.clone(),
        backend,
        Arc::new(notifier),
        &FakeBackend::config(),
    );
    (manager, store, notices)
}

pub(crate) fn drain(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut drained = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        drained.push(notice);
    }
    drained
}
