//! Plain HTTP backend: a reqwest client carrying the credential cookies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use super::{load_cookies, Session, SessionProvider, StoredCookie};
use crate::config::Config;
use crate::error::ScrapeError;

/// Cookie store loaded once and never written to afterwards.
///
/// `Set-Cookie` headers from the portal are ignored so every request of a run
/// carries the same credentials.
pub struct FrozenCookies {
    jar: Jar,
}

impl FrozenCookies {
    fn from_cookies(cookies: &[StoredCookie]) -> (Self, usize) {
        let jar = Jar::default();
        let mut loaded = 0;
        for c in cookies {
            let host = c.host();
            let Ok(url) = Url::parse(&format!("https://{}{}", host, c.path)) else {
                warn!("Skipping cookie {} with unusable domain {:?}", c.name, c.domain);
                continue;
            };
            let mut header = format!("{}={}; Domain={}; Path={}", c.name, c.value, host, c.path);
            if c.secure {
                header.push_str("; Secure");
            }
            if c.http_only {
                header.push_str("; HttpOnly");
            }
            jar.add_cookie_str(&header, &url);
            loaded += 1;
        }
        (FrozenCookies { jar }, loaded)
    }
}

impl CookieStore for FrozenCookies {
    fn set_cookies(&self, _cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &Url) {}

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}

pub struct HttpSessionProvider {
    cookies_path: PathBuf,
    user_agent: String,
    page_timeout: Duration,
}

impl HttpSessionProvider {
    pub fn new(config: &Config) -> Self {
        HttpSessionProvider {
            cookies_path: config.cookies_path.clone(),
            user_agent: config.user_agent.clone(),
            page_timeout: config.page_timeout,
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn create_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        let cookies = load_cookies(&self.cookies_path).await?;
        let (store, loaded) = FrozenCookies::from_cookies(&cookies);
        if loaded == 0 {
            return Err(ScrapeError::SessionUnavailable(format!(
                "no usable cookies in {}",
                self.cookies_path.display()
            )));
        }

        let client = reqwest::Client::builder()
            .cookie_provider(Arc::new(store))
            .user_agent(&self.user_agent)
            .timeout(self.page_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ScrapeError::SessionUnavailable(format!("http client: {}", e)))?;

        info!("HTTP session ready ({} cookies)", loaded);
        Ok(Box::new(HttpSession {
            client,
            address: None,
            document: None,
        }))
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    /// Last address passed to `navigate`.
    address: Option<String>,
    document: Option<String>,
}

#[async_trait]
impl Session for HttpSession {
    async fn navigate(&mut self, address: &str) -> Result<u16, ScrapeError> {
        self.address = Some(address.to_string());
        self.document = None;
        let response = self
            .client
            .get(address)
            .send()
            .await
            .map_err(|e| ScrapeError::navigation(address, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::navigation(address, e))?;
        debug!(address, status, bytes = body.len(), "navigated");
        self.document = Some(body);
        Ok(status)
    }

    // The body has been read in full by `navigate`, nothing is still in flight.
    async fn wait_for_idle(&mut self) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn has_element(&mut self, selector: &str) -> bool {
        self.document
            .as_deref()
            .is_some_and(|html| document_has(html, selector))
    }

    async fn content(&mut self) -> Result<String, ScrapeError> {
        if let Some(html) = &self.document {
            return Ok(html.clone());
        }
        Err(match &self.address {
            Some(address) => ScrapeError::navigation(address, "no document loaded"),
            None => ScrapeError::SessionUnavailable("content requested before navigation".into()),
        })
    }

    // Nothing runs client-side, so the document never changes after `navigate`.
    fn is_live(&self) -> bool {
        false
    }

    async fn close(self: Box<Self>) {
        debug!("HTTP session closed");
    }
}

fn document_has(html: &str, selector: &str) -> bool {
    let Ok(sel) = Selector::parse(selector) else {
        return false;
    };
    Html::parse_document(html).select(&sel).next().is_some()
}

// ── Tests ──
