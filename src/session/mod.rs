//! Authenticated browsing sessions.
//!
//! The pipeline only talks to [`Session`] and [`SessionProvider`]. Two
//! backends ship: headless Chromium (the default, needed for pages rendered
//! client-side) and a plain HTTP client. Both carry the portal's credential
//! cookies, read once from a Playwright-style cookie dump.

mod browser;
mod http;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{Backend, Config};
use crate::error::ScrapeError;

pub use browser::BrowserSessionProvider;
pub use http::HttpSessionProvider;

/// A live browsing context. Owned by exactly one worker, never shared.
#[async_trait]
pub trait Session: Send {
    /// Load `address`, returning the response status code.
    async fn navigate(&mut self, address: &str) -> Result<u16, ScrapeError>;

    /// Resolves once the page has stopped loading resources.
    async fn wait_for_idle(&mut self) -> Result<(), ScrapeError>;

    /// Whether the current document has an element matching the CSS selector.
    async fn has_element(&mut self, selector: &str) -> bool;

    /// HTML of the current document.
    async fn content(&mut self) -> Result<String, ScrapeError>;

    /// Whether the document can still change after `navigate` returns.
    fn is_live(&self) -> bool {
        true
    }

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn Session>, ScrapeError>;
}

/// Provider picked from the configured backend.
pub enum BackendProvider {
    Browser(BrowserSessionProvider),
    Http(HttpSessionProvider),
}

impl BackendProvider {
    pub fn new(config: &Config) -> Self {
        match config.backend {
            Backend::Browser => BackendProvider::Browser(BrowserSessionProvider::new(config)),
            Backend::Http => BackendProvider::Http(HttpSessionProvider::new(config)),
        }
    }
}

#[async_trait]
impl SessionProvider for BackendProvider {
    async fn create_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        match self {
            BackendProvider::Browser(p) => p.create_session().await,
            BackendProvider::Http(p) => p.create_session().await,
        }
    }
}

// ── Credentials ──

/// One entry of a Playwright-style cookie dump.
#[derive(Debug, Clone, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    #[serde(default = "root_path")]
    path: String,
    #[serde(default)]
    secure: bool,
    #[serde(default, rename = "httpOnly")]
    http_only: bool,
}

fn root_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Domain without the leading dot Playwright writes for host-wide cookies.
    fn host(&self) -> &str {
        self.domain.trim_start_matches('.')
    }
}

fn parse_cookies(raw: &str) -> Result<Vec<StoredCookie>, ScrapeError> {
    serde_json::from_str(raw)
        .map_err(|e| ScrapeError::SessionUnavailable(format!("invalid cookie file: {}", e)))
}

/// Read the cookie dump. A missing, unreadable or empty file leaves no usable credentials.
async fn load_cookies(path: &Path) -> Result<Vec<StoredCookie>, ScrapeError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        ScrapeError::SessionUnavailable(format!(
            "cannot read cookie file {}: {}",
            path.display(),
            e
        ))
    })?;
    let cookies = parse_cookies(&raw)?;
    if cookies.is_empty() {
        return Err(ScrapeError::SessionUnavailable(format!(
            "no cookies in {}",
            path.display()
        )));
    }
    Ok(cookies)
}

// ── Tests ──
