//! Thin adapters for the systems a migration talks to.
//!
//! Each adapter implements one collaborator trait from
//! `contentmigrator-shared` and does nothing beyond request/response
//! plumbing and error classification:
//! - [`content`]: content sources (local directory, JSON-over-HTTP)
//! - [`ai`]: the closed set of AI provider variants
//! - [`object_store`]: asset storage (local directory, HTTP PUT)

pub mod ai;
pub mod content;
pub mod object_store;

use std::time::Duration;

use reqwest::{Client, Response};

use contentmigrator_shared::{MigratorError, Result};

pub use ai::{ExtractiveProvider, OpenAiProvider, Provider};
pub use content::{DirectorySource, HttpSource};
pub use object_store::{HttpObjectStore, LocalObjectStore};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("ContentMigrator/", env!("CARGO_PKG_VERSION"));

/// Default timeout for a single request.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Build the shared HTTP client.
pub(crate) fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| MigratorError::fatal(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport-level failure.
pub(crate) fn transport_error(context: &str, e: reqwest::Error) -> MigratorError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        MigratorError::Transient(format!("{context}: {e}"))
    } else {
        MigratorError::fatal(format!("{context}: {e}"))
    }
}

/// Longest retry-after hint honored, in seconds.
const MAX_RETRY_AFTER_SECS: u64 = 3_600;

/// Pass successful responses through; map failure statuses onto the taxonomy.
pub(crate) fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.min(MAX_RETRY_AFTER_SECS) * 1_000);

    Err(MigratorError::from_http_status(
        status.as_u16(),
        context,
        retry_after_ms,
    ))
}

/// Join a base URL and a relative path with exactly one slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
