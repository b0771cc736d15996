//! Authenticated request execution.
//!
//! Callers hand over a request description and get the response back; token
//! attachment, refresh on 401, the single retry and forced logout all happen
//! in here.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{ApiRequest, ApiResponse};

use super::credentials::CredentialKey;
use super::manager::SessionCore;
use super::refresh::RefreshTrigger;
use super::SessionError;

/// Handle for issuing requests on behalf of the signed-in user.
/// Clone is cheap.
#[derive(Clone)]
pub struct AuthenticatedClient {
    core: Arc<SessionCore>,
}

impl AuthenticatedClient {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// Send `request` with the current access token.
    ///
    /// Responses other than 401 are returned as-is. On a 401 the access
    /// token is refreshed (shared with any concurrent refresh) and the request
    /// is retried exactly once. If the refresh fails, or there is nothing to
    /// refresh with, the session is expired and `SessionExpired` is returned.
    /// A retry that is also rejected expires the session and is returned to
    /// the caller.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.core.state.wait_until_initialized().await;

        let epoch = self.core.guard.current();
        let mut request = request;
        request.url = self.core.endpoints.resolve(&request.url);

        let token = self.core.state.access_token();
        let response = self.send(&request, token.as_deref()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(url = %request.url, "Request unauthorized, refreshing access token");

        let Some((refresh_token, username)) = self.refresh_material().await else {
            warn!(url = %request.url, "No refresh token available");
            self.core.logout_once(epoch).await;
            return Err(SessionError::SessionExpired);
        };

        let trigger = RefreshTrigger::Rejected { token };
        let new_token = match self
            .core
            .refresh_access_token(trigger, refresh_token, username)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Could not refresh access token");
                self.core.logout_once(epoch).await;
                return Err(SessionError::SessionExpired);
            }
        };

        let retried = self.send(&request, Some(&new_token)).await?;
        if retried.is_unauthorized() {
            warn!(url = %request.url, "Request still unauthorized after refresh");
            self.core.logout_once(epoch).await;
        }
        Ok(retried)
    }

    /// Refresh token and username from the store, falling back to the
    /// in-memory username. Store failures count as absent.
    async fn refresh_material(&self) -> Option<(String, String)> {
        let refresh_token = match self.core.store.get(CredentialKey::RefreshToken).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read refresh token");
                None
            }
        };
        let username = match self.core.store.get(CredentialKey::Username).await {
            Ok(Some(username)) => Some(username),
            Ok(None) => self.core.state.username(),
            Err(e) => {
                warn!(error = %e, "Failed to read stored username");
                self.core.state.username()
            }
        };
        Some((refresh_token?, username?))
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, SessionError> {
        let mut outbound = request.clone();
        if let Some(token) = token {
            outbound = outbound.bearer_auth(token).map_err(SessionError::Unexpected)?;
        }
        self.core
            .endpoints
            .transport()
            .send(outbound)
            .await
            .map_err(SessionError::Unexpected)
    }
}
