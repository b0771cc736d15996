//! In-memory session state.
//!
//! [`SessionState`] is the single source of truth for who is signed in. It is
//! published through a `tokio::sync::watch` channel so front ends can observe
//! transitions; only the lifecycle controller and the refresh coordinator
//! mutate it (the mutators are crate-private).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// Process started, `initialize` not yet called
    Uninitialized,
    /// Reading persisted credentials
    Hydrating,
    Unauthenticated,
    Authenticated,
    /// A token refresh is in flight; still authenticated from the caller's view
    Refreshing,
}

#[derive(Clone)]
pub struct Session {
    pub access_token: Option<String>,
    pub username: Option<String>,
    pub is_initializing: bool,
    pub phase: SessionPhase,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            access_token: None,
            username: None,
            is_initializing: true,
            phase: SessionPhase::Uninitialized,
            authenticated_at: None,
            refreshed_at: None,
        }
    }
}

// Tokens stay out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("has_access_token", &self.access_token.is_some())
            .field("username", &self.username)
            .field("is_initializing", &self.is_initializing)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Session {
    /// True once the session resolved to a signed-in user. A session restored
    /// without a stored access token counts: the first request refreshes it.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Authenticated | SessionPhase::Refreshing
        )
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Minutes since the access token was last issued (for display)
    pub fn minutes_since_refresh(&self) -> Option<i64> {
        self.refreshed_at
            .or(self.authenticated_at)
            .map(|at| (Utc::now() - at).num_minutes().max(0))
    }

    /// One-line human readable status
    pub fn describe(&self) -> String {
        match self.phase {
            SessionPhase::Uninitialized | SessionPhase::Hydrating => "Starting up".to_string(),
            SessionPhase::Unauthenticated => "Not logged in".to_string(),
            SessionPhase::Authenticated | SessionPhase::Refreshing => {
                let user = self.username.as_deref().unwrap_or("unknown user");
                match (self.has_access_token(), self.minutes_since_refresh()) {
                    (false, _) => format!("Logged in as {} (token will refresh on next request)", user),
                    (true, Some(minutes)) => format!("Logged in as {} (token issued {}m ago)", user, minutes),
                    (true, None) => format!("Logged in as {}", user),
                }
            }
        }
    }
}

pub struct SessionState {
    tx: watch::Sender<Session>,
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    /// Resolves once `initialize` has finished, successfully or not
    pub async fn wait_until_initialized(&self) -> Session {
        let mut rx = self.tx.subscribe();
        let ready = rx.wait_for(|session| !session.is_initializing).await;
        match ready {
            Ok(session) => (*session).clone(),
            // The sender lives as long as `self`
            Err(_) => self.snapshot(),
        }
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token.clone()
    }

    pub(crate) fn username(&self) -> Option<String> {
        self.tx.borrow().username.clone()
    }

    pub(crate) fn begin_hydrating(&self) {
        self.tx.send_modify(|s| {
            s.is_initializing = true;
            s.phase = SessionPhase::Hydrating;
        });
    }

    pub(crate) fn resolve_unauthenticated(&self) {
        self.tx.send_modify(|s| {
            s.access_token = None;
            s.username = None;
            s.is_initializing = false;
            s.phase = SessionPhase::Unauthenticated;
            s.authenticated_at = None;
            s.refreshed_at = None;
        });
    }

    pub(crate) fn resolve_authenticated(&self, username: String, access_token: Option<String>) {
        self.tx.send_modify(|s| {
            s.access_token = access_token;
            s.username = Some(username);
            s.is_initializing = false;
            s.phase = SessionPhase::Authenticated;
            s.authenticated_at = None;
            s.refreshed_at = None;
        });
    }

    pub(crate) fn set_logged_in(&self, username: String, access_token: String) {
        self.tx.send_modify(|s| {
            s.access_token = Some(access_token);
            s.username = Some(username);
            s.is_initializing = false;
            s.phase = SessionPhase::Authenticated;
            s.authenticated_at = Some(Utc::now());
            s.refreshed_at = None;
        });
    }

    pub(crate) fn begin_refresh(&self) {
        self.tx.send_if_modified(|s| {
            if s.phase == SessionPhase::Authenticated {
                s.phase = SessionPhase::Refreshing;
                return true;
            }
            false
        });
    }

    /// Install a refreshed token. Ignored unless a user is signed in.
    pub(crate) fn finish_refresh(&self, access_token: String) {
        self.tx.send_if_modified(|s| {
            if !matches!(s.phase, SessionPhase::Authenticated | SessionPhase::Refreshing) {
                return false;
            }
            s.access_token = Some(access_token);
            s.refreshed_at = Some(Utc::now());
            s.phase = SessionPhase::Authenticated;
            true
        });
    }

    pub(crate) fn abort_refresh(&self) {
        self.tx.send_if_modified(|s| {
            if s.phase == SessionPhase::Refreshing {
                s.phase = SessionPhase::Authenticated;
                return true;
            }
            false
        });
    }

    /// Drop the signed-in identity. `is_initializing` is left alone.
    pub(crate) fn clear(&self) {
        self.tx.send_modify(|s| {
            s.access_token = None;
            s.username = None;
            s.phase = SessionPhase::Unauthenticated;
            s.authenticated_at = None;
            s.refreshed_at = None;
        });
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
