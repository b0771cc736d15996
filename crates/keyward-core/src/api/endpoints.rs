//! Authentication, refresh and revocation endpoints.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::{resolve_url, Config};

use super::transport::{ApiRequest, HttpTransport};
use super::ApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    username: &'a str,
    refresh_token: &'a str,
}

/// Tokens granted by the authentication endpoint
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Tokens granted by the refresh endpoint. The server may or may not rotate
/// the refresh token.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Result of an exchange that reached the server
#[derive(Clone)]
pub enum Exchange<T> {
    Granted(T),
    /// Any non-success status
    Rejected(StatusCode),
}

#[derive(Clone)]
pub struct AuthEndpoints {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    login_url: String,
    refresh_url: String,
    revoke_url: String,
}

impl AuthEndpoints {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &Config) -> Self {
        Self {
            transport,
            base_url: config.api_base_url.clone(),
            login_url: config.endpoint_url(&config.login_path),
            refresh_url: config.endpoint_url(&config.refresh_path),
            revoke_url: config.endpoint_url(&config.revoke_path),
        }
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Resolve a request target against the API base URL
    pub fn resolve(&self, target: &str) -> String {
        resolve_url(&self.base_url, target)
    }

    /// Exchange username and password for an access/refresh token pair
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Exchange<LoginTokens>> {
        let request = ApiRequest::post(&self.login_url)
            .header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .json(&LoginRequest { username, password })?;

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send authentication request")?;

        if !response.is_success() {
            return Ok(Exchange::Rejected(response.status));
        }

        let tokens = response.json().context("Failed to parse auth response")?;
        Ok(Exchange::Granted(tokens))
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, username: &str, refresh_token: &str) -> Result<Exchange<RefreshedTokens>> {
        let request = ApiRequest::post(&self.refresh_url)
            .header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .json(&RefreshRequest {
                username,
                refresh_token,
            })?;

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send token refresh request")?;

        if !response.is_success() {
            return Ok(Exchange::Rejected(response.status));
        }

        let tokens = response.json().context("Failed to parse refresh response")?;
        Ok(Exchange::Granted(tokens))
    }

    /// Revoke an access token. Callers treat failures as best-effort.
    pub async fn revoke(&self, access_token: &str) -> Result<()> {
        let request = ApiRequest::post(&self.revoke_url).bearer_auth(access_token)?;

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send revocation request")?;

        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.text()).into());
        }
        Ok(())
    }
}
