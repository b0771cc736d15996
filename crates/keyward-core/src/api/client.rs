//! Typed JSON client on top of the authenticated request executor.
//!
//! Status handling lives here rather than in the executor: the executor only
//! cares about 401s and hands every other response back untouched, while this
//! layer turns non-success statuses into [`ApiError`]s and backs off on 429s.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::auth::AuthenticatedClient;

use super::transport::ApiRequest;
use super::ApiError;

/// Retries for a 429 before the error is handed back. The delay doubles
/// each time, so the last wait is 4s.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - the executor shares the session core.
#[derive(Clone)]
pub struct ApiClient {
    client: AuthenticatedClient,
}

impl ApiClient {
    pub fn new(client: AuthenticatedClient) -> Self {
        Self { client }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(target)).await
    }

    pub async fn post_json<T, B>(&self, target: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = ApiRequest::post(target)
            .json(body)
            .map_err(|e| ApiError::InvalidResponse(format!("{:#}", e)))?;
        self.send_json(request).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.client.execute(request.clone()).await?;

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            if !response.is_success() {
                return Err(ApiError::from_status(response.status, &response.text()));
            }

            return response
                .json()
                .map_err(|e| ApiError::InvalidResponse(format!("{:#}", e)));
        }
    }
}
