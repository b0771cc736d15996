//! Single-flight access token refresh.
//!
//! At most one refresh exchange is in flight per process. The first caller
//! creates a shared pending outcome and parks it in [`RefreshSlot`]; everyone
//! arriving while it is pending awaits the same outcome instead of hitting the
//! refresh endpoint again. The exchange itself runs on a spawned task so it
//! settles even if every waiter is dropped, and it empties the slot once it
//! has settled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::api::Exchange;

use super::credentials::CredentialKey;
use super::manager::SessionCore;
use super::SessionError;

/// Why a shared refresh failed. Cloned out to every waiter.
#[derive(Debug, Clone)]
pub(crate) enum RefreshFailure {
    /// The refresh endpoint answered with a non-success status
    Rejected(StatusCode),
    /// Network failure or malformed response
    Exchange(String),
    /// New tokens could not be persisted
    Store(String),
    /// The session ended while the exchange was in flight
    SessionEnded,
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshFailure::Rejected(status) => write!(f, "refresh token rejected ({})", status),
            RefreshFailure::Exchange(msg) => write!(f, "refresh exchange failed: {}", msg),
            RefreshFailure::Store(msg) => write!(f, "could not persist refreshed token: {}", msg),
            RefreshFailure::SessionEnded => f.write_str("session ended during refresh"),
        }
    }
}

type RefreshOutcome = Result<String, RefreshFailure>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    id: u64,
    outcome: PendingRefresh,
}

/// What prompted a refresh
#[derive(Debug, Clone)]
pub(crate) enum RefreshTrigger {
    /// Caller asked for a new token outright
    Explicit,
    /// A request carrying `token` was answered with 401
    Rejected { token: Option<String> },
}

#[derive(Default)]
pub(crate) struct RefreshSlot {
    pending: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl RefreshSlot {
    fn lock(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Forget any pending refresh so the next 401 starts a fresh exchange
    pub(crate) fn reset(&self) {
        self.lock().take();
    }

    fn settle(&self, id: u64) {
        let mut pending = self.lock();
        if pending.as_ref().is_some_and(|flight| flight.id == id) {
            *pending = None;
        }
    }
}

/// Result of looking at the slot under its lock
enum Attach {
    Join(PendingRefresh),
    AlreadyRefreshed(String),
}

impl SessionCore {
    /// Exchange the refresh token for a new access token, sharing an
    /// in-flight exchange when there is one.
    pub(crate) async fn refresh_access_token(
        self: &Arc<Self>,
        trigger: RefreshTrigger,
        refresh_token: String,
        username: String,
    ) -> Result<String, SessionError> {
        let attach = {
            let mut slot = self.refresh.lock();
            match slot.as_ref() {
                Some(flight) => {
                    debug!(refresh_id = flight.id, "Joining in-flight token refresh");
                    Attach::Join(flight.outcome.clone())
                }
                None => match self.replacement_token(&trigger) {
                    // Slot is empty but the token already moved on: a refresh
                    // for this rejection settled before we got here
                    Some(current) => Attach::AlreadyRefreshed(current),
                    None => {
                        let id = self.refresh.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                        let epoch = self.guard.current();
                        let core = Arc::clone(self);
                        let outcome = async move { core.run_refresh(id, epoch, refresh_token, username).await }
                            .boxed()
                            .shared();
                        *slot = Some(InFlight {
                            id,
                            outcome: outcome.clone(),
                        });
                        tokio::spawn(outcome.clone());
                        debug!(refresh_id = id, epoch, "Started token refresh");
                        Attach::Join(outcome)
                    }
                },
            }
        };

        match attach {
            Attach::AlreadyRefreshed(token) => Ok(token),
            Attach::Join(outcome) => outcome
                .await
                .map_err(|failure| SessionError::RefreshFailed(failure.to_string())),
        }
    }

    fn replacement_token(&self, trigger: &RefreshTrigger) -> Option<String> {
        let RefreshTrigger::Rejected { token: rejected } = trigger else {
            return None;
        };
        self.state
            .access_token()
            .filter(|current| rejected.as_deref() != Some(current.as_str()))
    }

    async fn run_refresh(self: Arc<Self>, id: u64, epoch: u64, refresh_token: String, username: String) -> RefreshOutcome {
        self.state.begin_refresh();

        let outcome = self.exchange_refresh(epoch, &refresh_token, &username).await;
        match &outcome {
            Ok(_) => info!(username = %username, "Access token refreshed"),
            Err(failure) => {
                warn!(username = %username, error = %failure, "Token refresh failed");
                self.state.abort_refresh();
                self.logout_once(epoch).await;
            }
        }

        self.refresh.settle(id);
        outcome
    }

    async fn exchange_refresh(&self, epoch: u64, refresh_token: &str, username: &str) -> RefreshOutcome {
        let tokens = match self.endpoints.refresh(username, refresh_token).await {
            Ok(Exchange::Granted(tokens)) => tokens,
            Ok(Exchange::Rejected(status)) => return Err(RefreshFailure::Rejected(status)),
            Err(e) => return Err(RefreshFailure::Exchange(format!("{:#}", e))),
        };

        let _writes = self.writes.lock().await;
        if !self.guard.is_open(epoch) {
            warn!(epoch, "Discarding refreshed token for a session that has ended");
            return Err(RefreshFailure::SessionEnded);
        }

        self.store
            .set(CredentialKey::AccessToken, &tokens.access_token)
            .await
            .map_err(|e| RefreshFailure::Store(e.to_string()))?;
        if let Some(rotated) = tokens.refresh_token.as_deref() {
            debug!("Server rotated the refresh token");
            self.store
                .set(CredentialKey::RefreshToken, rotated)
                .await
                .map_err(|e| RefreshFailure::Store(e.to_string()))?;
        }

        if !self.guard.is_open(epoch) {
            warn!(epoch, "Session ended while storing refreshed token, discarding it");
            self.discard_credentials().await;
            return Err(RefreshFailure::SessionEnded);
        }

        self.state.finish_refresh(tokens.access_token.clone());
        Ok(tokens.access_token)
    }
}
