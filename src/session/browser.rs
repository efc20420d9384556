//! Headless Chromium backend. Runs the portal's client-side rendering, so
//! idle, settle and marker waits see the document change after navigation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{load_cookies, Session, SessionProvider, StoredCookie};
use crate::config::Config;
use crate::error::ScrapeError;

pub struct BrowserSessionProvider {
    cookies_path: PathBuf,
    browser_path: Option<PathBuf>,
    headless: bool,
    user_agent: String,
    page_timeout: Duration,
}

impl BrowserSessionProvider {
    pub fn new(config: &Config) -> Self {
        BrowserSessionProvider {
            cookies_path: config.cookies_path.clone(),
            browser_path: config.browser_path.clone(),
            headless: config.headless,
            user_agent: config.user_agent.clone(),
            page_timeout: config.page_timeout,
        }
    }

    fn browser_config(&self, profile: &TempDir) -> Result<BrowserConfig, ScrapeError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(self.page_timeout)
            .window_size(1920, 1080)
            .user_data_dir(profile.path())
            .arg(format!("--user-agent={}", self.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox");
        builder = if self.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };
        if let Some(path) = &self.browser_path {
            builder = builder.chrome_executable(path);
        }
        builder
            .build()
            .map_err(|e| ScrapeError::SessionUnavailable(format!("browser config: {}", e)))
    }
}

#[async_trait]
impl SessionProvider for BrowserSessionProvider {
    async fn create_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        let cookies = cookie_params(&load_cookies(&self.cookies_path).await?);
        if cookies.is_empty() {
            return Err(ScrapeError::SessionUnavailable(format!(
                "no usable cookies in {}",
                self.cookies_path.display()
            )));
        }
        let loaded = cookies.len();

        let profile = TempDir::new()
            .map_err(|e| ScrapeError::SessionUnavailable(format!("browser profile: {}", e)))?;
        let (mut browser, mut handler) = Browser::launch(self.browser_config(&profile)?)
            .await
            .map_err(|e| ScrapeError::SessionUnavailable(format!("browser launch: {}", e)))?;

        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {:?}", e);
                }
            }
        });

        let page = match open_page(&browser, cookies).await {
            Ok(page) => page,
            Err(e) => {
                shutdown(&mut browser, events).await;
                return Err(e);
            }
        };

        info!("Browser session ready ({} cookies)", loaded);
        Ok(Box::new(BrowserSession {
            browser,
            events,
            page,
            profile,
            address: None,
        }))
    }
}

/// Blank tab with the credential cookies installed.
async fn open_page(browser: &Browser, cookies: Vec<CookieParam>) -> Result<Page, ScrapeError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| ScrapeError::SessionUnavailable(format!("new page: {}", e)))?;
    page.set_cookies(cookies)
        .await
        .map_err(|e| ScrapeError::SessionUnavailable(format!("installing cookies: {}", e)))?;
    Ok(page)
}

async fn shutdown(browser: &mut Browser, events: JoinHandle<()>) {
    if let Err(e) = browser.close().await {
        warn!("Browser did not close cleanly: {}", e);
    }
    if let Err(e) = browser.wait().await {
        warn!("Browser process wait failed: {}", e);
    }
    events.abort();
}

fn cookie_params(cookies: &[StoredCookie]) -> Vec<CookieParam> {
    cookies
        .iter()
        .filter_map(|c| {
            CookieParam::builder()
                .name(c.name.clone())
                .value(c.value.clone())
                .domain(c.domain.clone())
                .path(c.path.clone())
                .secure(c.secure)
                .http_only(c.http_only)
                .build()
                .map_err(|e| warn!("Skipping cookie {}: {}", c.name, e))
                .ok()
        })
        .collect()
}

pub struct BrowserSession {
    browser: Browser,
    events: JoinHandle<()>,
    page: Page,
    /// Removed when the session is dropped.
    profile: TempDir,
    address: Option<String>,
}

impl BrowserSession {
    fn address(&self) -> &str {
        self.address.as_deref().unwrap_or("about:blank")
    }
}

#[async_trait]
impl Session for BrowserSession {
    async fn navigate(&mut self, address: &str) -> Result<u16, ScrapeError> {
        self.address = Some(address.to_string());
        self.page
            .goto(address)
            .await
            .map_err(|e| ScrapeError::navigation(address, e))?;

        let status = self
            .page
            .wait_for_navigation_response()
            .await
            .ok()
            .flatten()
            .and_then(|request| request.response.as_ref().map(|r| r.status))
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or(200);
        debug!(address, status, "navigated");
        Ok(status)
    }

    async fn wait_for_idle(&mut self) -> Result<(), ScrapeError> {
        let address = self.address().to_string();
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| ScrapeError::navigation(&address, e))?;
        Ok(())
    }

    async fn has_element(&mut self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    async fn content(&mut self) -> Result<String, ScrapeError> {
        match self.page.content().await {
            Ok(html) => Ok(html),
            Err(e) => Err(ScrapeError::navigation(self.address(), e)),
        }
    }

    async fn close(self: Box<Self>) {
        let BrowserSession {
            mut browser,
            events,
            page,
            profile,
            ..
        } = *self;
        if let Err(e) = page.close().await {
            debug!("Page close failed: {}", e);
        }
        shutdown(&mut browser, events).await;
        drop(profile);
        debug!("Browser session closed");
    }
}

// ── Tests ──
