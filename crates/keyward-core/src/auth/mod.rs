//! Authentication module: session state, token refresh and authenticated
//! requests.
//!
//! This module provides:
//! - `SessionManager`: `initialize`, `login` and `logout`
//! - `AuthenticatedClient`: attaches the access token, refreshes on 401 and
//!   retries once
//! - `CredentialStore`: durable storage via the OS keychain, a JSON file, or
//!   memory
//!
//! At most one token refresh is in flight at a time; concurrent 401s share
//! its outcome. Forced logouts happen at most once per session epoch.

pub mod credentials;
pub mod error;
pub mod executor;
mod guard;
pub mod manager;
pub mod notify;
mod refresh;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use credentials::{CredentialKey, CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError};
pub use error::SessionError;
pub use executor::AuthenticatedClient;
pub use manager::SessionManager;
pub use notify::{ChannelNotifier, Notice, NoticeLevel, Notifier, TracingNotifier};
pub use session::{Session, SessionPhase, SessionState};
