//! Session lifecycle: `initialize`, `login`, `logout`.
//!
//! [`SessionManager`] is the public face of the coordinator. It owns the
//! session state and the credential store, and hands out
//! [`AuthenticatedClient`]s for outbound calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, AuthEndpoints, Exchange, HttpTransport, ReqwestTransport};
use crate::config::{Config, CredentialBackend};

use super::credentials::{CredentialKey, CredentialStore, FileStore, KeyringStore, StoreError};
use super::executor::AuthenticatedClient;
use super::guard::EpochGuard;
use super::notify::{
    NoticeLevel, Notifier, GENERIC_ERROR_MESSAGE, INVALID_CREDENTIALS_MESSAGE,
    SESSION_EXPIRED_MESSAGE,
};
use super::refresh::{RefreshSlot, RefreshTrigger};
use super::session::{Session, SessionState};
use super::SessionError;

/// Shared state behind every handle (manager, executor, API client)
pub(crate) struct SessionCore {
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) endpoints: AuthEndpoints,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) state: SessionState,
    pub(crate) guard: EpochGuard,
    pub(crate) refresh: RefreshSlot,
    /// Held while credentials are written or cleared, so a logout cannot
    /// interleave with a refresh or login write-back
    pub(crate) writes: Mutex<()>,
    initialized: AtomicBool,
}

impl SessionCore {
    /// Best-effort revoke, then clear memory and storage. Safe to call when
    /// already logged out.
    pub(crate) async fn logout(&self) {
        self.guard.close();
        let writes = self.writes.lock().await;

        if let Some(token) = self.state.access_token() {
            if let Err(e) = self.endpoints.revoke(&token).await {
                warn!(error = %e, "Failed to revoke access token");
            }
        }

        self.state.clear();
        self.discard_credentials().await;
        drop(writes);

        self.notifier.redirect_to_login();
        info!("Logged out");
    }

    /// Remove every stored credential. Callers hold `writes`.
    pub(crate) async fn discard_credentials(&self) {
        for key in CredentialKey::ALL {
            if let Err(e) = self.store.remove(key).await {
                warn!(key = %key, error = %e, "Failed to remove stored credential");
            }
        }
    }

    /// Force a logout for `epoch`. However many callers race here, only the
    /// first one in the epoch notifies and logs out. Returns whether this call
    /// did.
    pub(crate) async fn logout_once(&self, epoch: u64) -> bool {
        if !self.guard.try_close(epoch) {
            debug!(epoch, "Session epoch already ended, skipping logout");
            return false;
        }

        warn!(epoch, "Session expired, logging out");
        self.notifier.notify(NoticeLevel::Warning, SESSION_EXPIRED_MESSAGE);
        self.logout().await;
        true
    }

    async fn hydrate(&self) -> Result<Session, StoreError> {
        let username = self.store.get(CredentialKey::Username).await?;
        let refresh_token = self.store.get(CredentialKey::RefreshToken).await?;

        let username = match (username, refresh_token) {
            (Some(username), Some(_)) => username,
            _ => {
                debug!("No stored credentials");
                self.state.resolve_unauthenticated();
                return Ok(self.state.snapshot());
            }
        };

        // May be stale or missing; the first 401 refreshes it
        let access_token = self.store.get(CredentialKey::AccessToken).await?;
        info!(username = %username, has_access_token = access_token.is_some(), "Restored session");
        self.state.resolve_authenticated(username, access_token);
        Ok(self.state.snapshot())
    }

    async fn persist_login(&self, username: &str, access_token: &str, refresh_token: &str) -> Result<(), StoreError> {
        futures::try_join!(
            self.store.set(CredentialKey::RefreshToken, refresh_token),
            self.store.set(CredentialKey::Username, username),
            self.store.set(CredentialKey::AccessToken, access_token),
        )?;
        Ok(())
    }
}

/// Clone is cheap - all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<SessionCore>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        let core = SessionCore {
            store,
            endpoints: AuthEndpoints::new(transport, config),
            notifier,
            state: SessionState::new(),
            guard: EpochGuard::new(),
            refresh: RefreshSlot::default(),
            writes: Mutex::new(()),
            initialized: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Build the production stack described by `config`: `reqwest` transport
    /// plus the configured credential backend
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::with_timeout(config.request_timeout())?;
        let store: Arc<dyn CredentialStore> = match config.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringStore::new()),
            CredentialBackend::File => Arc::new(
                FileStore::default_location().context("Failed to locate credentials file")?,
            ),
        };
        Ok(Self::new(store, Arc::new(transport), notifier, config))
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn session(&self) -> Session {
        self.core.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.core.state.subscribe()
    }

    pub async fn wait_until_initialized(&self) -> Session {
        self.core.state.wait_until_initialized().await
    }

    /// Executor for authenticated requests
    pub fn client(&self) -> AuthenticatedClient {
        AuthenticatedClient::new(Arc::clone(&self.core))
    }

    /// Typed JSON client over [`Self::client`]
    pub fn api(&self) -> ApiClient {
        ApiClient::new(self.client())
    }

    /// Restore the session from the credential store. Runs once per process;
    /// later calls return the current session without touching the store.
    ///
    /// A store failure is fatal for this call: the user is notified, the
    /// session is forced to a clean unauthenticated state and the error is
    /// returned.
    pub async fn initialize(&self) -> Result<Session, SessionError> {
        if self.core.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return Ok(self.session());
        }

        self.core.guard.begin();
        self.core.state.begin_hydrating();

        match self.core.hydrate().await {
            Ok(session) => Ok(session),
            Err(e) => {
                error!(error = %e, "Failed to restore session from credential store");
                self.core.notifier.notify(NoticeLevel::Error, GENERIC_ERROR_MESSAGE);
                self.core.logout().await;
                self.core.state.resolve_unauthenticated();
                Err(e.into())
            }
        }
    }

    /// Exchange credentials for tokens and start a new session epoch.
    ///
    /// A rejected login leaves any previous session state as it was.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, SessionError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            self.core
                .notifier
                .notify(NoticeLevel::Error, INVALID_CREDENTIALS_MESSAGE);
            return Err(SessionError::InvalidCredentials);
        }

        let tokens = match self.core.endpoints.authenticate(username, password).await {
            Ok(Exchange::Granted(tokens)) => tokens,
            Ok(Exchange::Rejected(status)) => {
                warn!(username = %username, status = %status, "Login rejected");
                self.core
                    .notifier
                    .notify(NoticeLevel::Error, INVALID_CREDENTIALS_MESSAGE);
                return Err(SessionError::InvalidCredentials);
            }
            Err(e) => {
                error!(username = %username, error = %e, "Login failed");
                self.core.notifier.notify(NoticeLevel::Error, GENERIC_ERROR_MESSAGE);
                return Err(SessionError::Unexpected(e));
            }
        };

        // Failures from the previous epoch can no longer log this one out
        let epoch = self.core.guard.begin();
        let writes = self.core.writes.lock().await;

        if let Err(e) = self
            .core
            .persist_login(username, &tokens.access_token, &tokens.refresh_token)
            .await
        {
            error!(username = %username, error = %e, "Failed to persist credentials");
            self.core.notifier.notify(NoticeLevel::Error, GENERIC_ERROR_MESSAGE);
            return Err(e.into());
        }

        if !self.core.guard.is_open(epoch) {
            warn!(username = %username, "Session ended during login, discarding credentials");
            self.core.discard_credentials().await;
            return Err(SessionError::SessionExpired);
        }

        self.core
            .state
            .set_logged_in(username.to_string(), tokens.access_token);
        self.core.refresh.reset();
        // Logging in also settles startup for callers that never initialized
        self.core.initialized.store(true, Ordering::SeqCst);
        drop(writes);

        info!(username = %username, "Login successful");
        self.core
            .notifier
            .notify(NoticeLevel::Success, &format!("Logged in as {}", username));
        Ok(self.session())
    }

    /// Revoke (best-effort) and clear the session. Always redirects to login.
    pub async fn logout(&self) {
        self.core.logout().await;
    }

    /// Expire the current session: at most once per epoch, with a single
    /// "session expired" notice. Returns whether this call performed the
    /// logout.
    pub async fn logout_once(&self) -> bool {
        let epoch = self.core.guard.current();
        self.core.logout_once(epoch).await
    }

    /// Exchange `refresh_token` for a new access token, joining an in-flight
    /// refresh if there is one
    pub async fn refresh_access_token(&self, refresh_token: &str, username: &str) -> Result<String, SessionError> {
        self.core
            .refresh_access_token(
                RefreshTrigger::Explicit,
                refresh_token.to_string(),
                username.to_string(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::auth::notify::Notice;
    use crate::auth::test_support::{authenticated_store, drain, harness, FakeBackend};
    use crate::auth::{MemoryStore, SessionPhase};

    use super::*;

    fn messages(notices: &[Notice]) -> Vec<(NoticeLevel, String)> {
        notices
            .iter()
            .filter_map(|n| match n {
                Notice::Message { level, text } => Some((*level, text.clone())),
                Notice::RedirectToLogin => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_login_persists_all_credentials() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let (manager, store, mut notices) = harness(backend.clone(), MemoryStore::new());
        manager.initialize().await.unwrap();

        let session = manager.login("alice", "secret").await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.username.as_deref(), Some("alice"));
        let (access, refresh) = backend.last_login_tokens().unwrap();
        assert_eq!(session.access_token.as_deref(), Some(access.as_str()));
        assert_eq!(store.value(CredentialKey::Username).as_deref(), Some("alice"));
        assert_eq!(store.value(CredentialKey::AccessToken), Some(access));
        assert_eq!(store.value(CredentialKey::RefreshToken), Some(refresh));
        assert_eq!(
            messages(&drain(&mut notices)),
            vec![(NoticeLevel::Success, "Logged in as alice".to_string())]
        );
    }

    #[tokio::test]
    async fn test_login_with_bad_password() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let (manager, store, mut notices) = harness(backend.clone(), MemoryStore::new());
        manager.initialize().await.unwrap();

        let err = manager.login("alice", "wrong").await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidCredentials));
        assert!(!manager.session().is_authenticated());
        assert!(store.is_empty());
        assert_eq!(
            messages(&drain(&mut notices)),
            vec![(NoticeLevel::Error, INVALID_CREDENTIALS_MESSAGE.to_string())]
        );

        // Each attempt is independent
        assert!(manager.login("alice", "wrong").await.is_err());
        assert!(manager.login("alice", "secret").await.is_ok());
        assert_eq!(backend.calls("login"), 3);
    }

    #[tokio::test]
    async fn test_rejected_login_keeps_previous_session_epoch() {
        let backend = Arc::new(FakeBackend::new().with_refresh_delay(Duration::from_millis(50)));
        backend.add_user("alice", "secret");
        backend.reject_refresh(true);
        let (manager, store, mut notices) = harness(backend.clone(), authenticated_store("stale", "r1"));
        manager.initialize().await.unwrap();
        let epoch = manager.core().guard.current();

        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh_access_token("r1", "alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.login("alice", "wrong").await.is_err());
        assert_eq!(manager.core().guard.current(), epoch);

        // The old session's own refresh failure still ends it
        assert!(refresh.await.unwrap().is_err());
        assert!(store.is_empty());
        assert!(!manager.session().is_authenticated());
        let notices = drain(&mut notices);
        assert!(messages(&notices).contains(&(NoticeLevel::Warning, SESSION_EXPIRED_MESSAGE.to_string())));
        assert_eq!(backend.calls("revoke"), 1);
    }

    #[tokio::test]
    async fn test_login_without_initialize_settles_startup() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let (manager, _store, _notices) = harness(backend, MemoryStore::new());

        manager.login("alice", "secret").await.unwrap();

        let session = tokio::time::timeout(Duration::from_secs(1), manager.wait_until_initialized())
            .await
            .unwrap();
        assert!(session.is_authenticated());
        // A later initialize does not overwrite the fresh login
        assert!(manager.initialize().await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn test_login_with_empty_fields_skips_network() {
        let backend = Arc::new(FakeBackend::new());
        let (manager, _store, _notices) = harness(backend.clone(), MemoryStore::new());

        assert!(matches!(
            manager.login("  ", "secret").await,
            Err(SessionError::InvalidCredentials)
        ));
        assert!(matches!(
            manager.login("alice", "").await,
            Err(SessionError::InvalidCredentials)
        ));
        assert_eq!(backend.calls("login"), 0);
    }

    #[tokio::test]
    async fn test_login_network_failure_is_unexpected() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        backend.fail_network(true);
        let (manager, _store, mut notices) = harness(backend.clone(), MemoryStore::new());

        let err = manager.login("alice", "secret").await.unwrap_err();

        assert!(matches!(err, SessionError::Unexpected(_)));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            messages(&drain(&mut notices)),
            vec![(NoticeLevel::Error, GENERIC_ERROR_MESSAGE.to_string())]
        );
    }

    #[tokio::test]
    async fn test_login_store_failure() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let store = MemoryStore::new();
        store.fail_writes(true);
        let (manager, _store, _notices) = harness(backend.clone(), store);

        let err = manager.login("alice", "secret").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
        assert!(!manager.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let (manager, store, mut notices) = harness(backend.clone(), MemoryStore::new());
        manager.initialize().await.unwrap();
        manager.login("alice", "secret").await.unwrap();
        drain(&mut notices);

        manager.logout().await;

        assert!(store.is_empty());
        let session = manager.session();
        assert!(!session.is_authenticated());
        assert_eq!(session.access_token, None);
        assert_eq!(session.username, None);
        assert_eq!(backend.calls("revoke"), 1);
        assert_eq!(drain(&mut notices), vec![Notice::RedirectToLogin]);
    }

    #[tokio::test]
    async fn test_logout_when_already_logged_out() {
        let backend = Arc::new(FakeBackend::new());
        let (manager, store, mut notices) = harness(backend.clone(), MemoryStore::new());
        manager.initialize().await.unwrap();

        manager.logout().await;
        manager.logout().await;

        assert!(store.is_empty());
        assert_eq!(backend.calls("revoke"), 0);
        assert_eq!(
            drain(&mut notices),
            vec![Notice::RedirectToLogin, Notice::RedirectToLogin]
        );
    }

    #[tokio::test]
    async fn test_logout_survives_revoke_failure() {
        let backend = Arc::new(FakeBackend::new());
        let (manager, store, _notices) = harness(backend.clone(), authenticated_store("a1", "r1"));
        manager.initialize().await.unwrap();
        backend.fail_network(true);

        manager.logout().await;

        assert!(store.is_empty());
        assert!(!manager.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_initialize_with_empty_store() {
        let backend = Arc::new(FakeBackend::new());
        let (manager, _store, _notices) = harness(backend, MemoryStore::new());

        let session = manager.initialize().await.unwrap();

        assert!(!session.is_initializing);
        assert!(!session.is_authenticated());
        assert_eq!(session.phase, SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_initialize_needs_both_username_and_refresh_token() {
        let backend = Arc::new(FakeBackend::new());
        let store = MemoryStore::with_values([
            (CredentialKey::Username, "bob"),
            (CredentialKey::AccessToken, "a1"),
        ]);
        let (manager, _store, _notices) = harness(backend, store);

        let session = manager.initialize().await.unwrap();
        assert!(!session.is_authenticated());
        assert_eq!(session.username, None);
        assert_eq!(session.access_token, None);
    }

    #[tokio::test]
    async fn test_initialize_without_access_token_is_authenticated() {
        let backend = Arc::new(FakeBackend::new());
        let store = MemoryStore::with_values([
            (CredentialKey::Username, "bob"),
            (CredentialKey::RefreshToken, "r1"),
        ]);
        let (manager, _store, _notices) = harness(backend, store);

        let session = manager.initialize().await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.username.as_deref(), Some("bob"));
        assert_eq!(session.access_token, None);
        assert!(!session.is_initializing);
    }

    #[tokio::test]
    async fn test_initialize_store_failure_forces_logout() {
        let backend = Arc::new(FakeBackend::new());
        let store = authenticated_store("a1", "r1");
        store.fail_reads(true);
        let (manager, store, mut notices) = harness(backend, store);

        let err = manager.initialize().await.unwrap_err();

        assert!(matches!(err, SessionError::Store(_)));
        let session = manager.session();
        assert!(!session.is_initializing);
        assert!(!session.is_authenticated());
        assert!(store.is_empty());
        let notices = drain(&mut notices);
        assert!(notices.contains(&Notice::Message {
            level: NoticeLevel::Error,
            text: GENERIC_ERROR_MESSAGE.to_string(),
        }));
        assert!(notices.contains(&Notice::RedirectToLogin));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let backend = Arc::new(FakeBackend::new());
        let (manager, store, _notices) = harness(backend, MemoryStore::new());

        manager.initialize().await.unwrap();
        store.set(CredentialKey::Username, "late").await.unwrap();
        store.set(CredentialKey::RefreshToken, "r9").await.unwrap();

        let session = manager.initialize().await.unwrap();
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_then_restart_restores_user() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let store = Arc::new(MemoryStore::new());
        let config = FakeBackend::config();
        let notifier: Arc<dyn Notifier> = Arc::new(crate::auth::TracingNotifier);

        let first = SessionManager::new(store.clone(), backend.clone(), notifier.clone(), &config);
        first.initialize().await.unwrap();
        first.login("alice", "secret").await.unwrap();
        drop(first);

        let restarted = SessionManager::new(store.clone(), backend.clone(), notifier, &config);
        let session = restarted.initialize().await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.username.as_deref(), Some("alice"));
        assert_eq!(session.access_token, store.value(CredentialKey::AccessToken));
    }

    #[tokio::test]
    async fn test_logout_once_is_single_shot_per_epoch() {
        let backend = Arc::new(FakeBackend::new());
        backend.add_user("alice", "secret");
        let (manager, _store, mut notices) = harness(backend.clone(), MemoryStore::new());
        manager.initialize().await.unwrap();
        manager.login("alice", "secret").await.unwrap();
        drain(&mut notices);

        let results = futures::future::join_all((0..6).map(|_| manager.logout_once())).await;

        assert_eq!(results.iter().filter(|did| **did).count(), 1);
        assert_eq!(backend.calls("revoke"), 1);
        let notices = drain(&mut notices);
        assert_eq!(
            messages(&notices),
            vec![(NoticeLevel::Warning, SESSION_EXPIRED_MESSAGE.to_string())]
        );
        assert_eq!(notices.iter().filter(|n| **n == Notice::RedirectToLogin).count(), 1);

        // A fresh login opens a new epoch
        manager.login("alice", "secret").await.unwrap();
        assert!(manager.logout_once().await);
    }
}
