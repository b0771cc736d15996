//! Keyward core - session and authenticated-request coordination.
//!
//! The [`SessionManager`] owns the signed-in state: it restores credentials at
//! startup, logs in and out, and hands out an [`AuthenticatedClient`] that
//! attaches the access token to outbound requests, refreshes it when the
//! server answers 401, and retries once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyward_core::{ApiRequest, Config, SessionManager, TracingNotifier};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let manager = SessionManager::from_config(&config, Arc::new(TracingNotifier))?;
//! manager.initialize().await?;
//! manager.login("alice", "secret").await?;
//! let response = manager.client().execute(ApiRequest::get("/items")).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
pub use auth::{
    AuthenticatedClient, ChannelNotifier, CredentialKey, CredentialStore, FileStore, KeyringStore,
    MemoryStore, Notice, NoticeLevel, Notifier, Session, SessionError, SessionManager,
    SessionPhase, StoreError, TracingNotifier,
};
pub use config::{Config, CredentialBackend};
