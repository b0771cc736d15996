//! HTTP plumbing for the session coordinator.
//!
//! This module provides:
//! - `HttpTransport`: the outbound request seam, with a `reqwest` implementation
//! - `AuthEndpoints`: login, refresh and revocation exchanges
//! - `ApiClient`: typed JSON helpers over the authenticated executor

pub mod client;
pub mod endpoints;
pub mod error;
pub mod transport;

pub use client::ApiClient;
pub use endpoints::{AuthEndpoints, Exchange, LoginTokens, RefreshedTokens};
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};

pub use reqwest::{header, Method, StatusCode};
