use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ScrapeError;
use crate::session::Session;
use crate::target::Target;

const MARKER_POLL: Duration = Duration::from_millis(250);

/// A loaded page, possibly incomplete when the marker never showed up.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub address: String,
    pub html: String,
    pub marker_found: bool,
}

/// Loads a target's page through a session and waits until it looks rendered.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    page_timeout: Duration,
    element_timeout: Duration,
    settle_delay: Duration,
    marker: String,
}

impl PageFetcher {
    pub fn new(config: &Config) -> Self {
        PageFetcher {
            page_timeout: config.page_timeout,
            element_timeout: config.element_timeout,
            settle_delay: config.settle_delay,
            marker: config.selectors.marker.clone(),
        }
    }

    /// Navigate, wait for idle, settle, then wait for the structural marker.
    ///
    /// Error statuses and navigation failures are `NavigationFailed`. A marker
    /// that never appears is only logged; the document is returned as is.
    /// Sessions whose document is fixed once loaded skip the settle delay and
    /// get a single marker check.
    pub async fn fetch(
        &self,
        session: &mut dyn Session,
        target: &Target,
    ) -> Result<RenderedDocument, ScrapeError> {
        let address = target.address.as_str();

        let status = timeout(self.page_timeout, session.navigate(address))
            .await
            .map_err(|_| {
                ScrapeError::navigation(address, format!("timed out after {:?}", self.page_timeout))
            })??;
        if status >= 400 {
            return Err(ScrapeError::navigation(address, format!("HTTP {}", status)));
        }

        timeout(self.page_timeout, session.wait_for_idle())
            .await
            .map_err(|_| ScrapeError::navigation(address, "network never went idle"))??;

        let marker_found = if session.is_live() {
            sleep(self.settle_delay).await;
            self.wait_for_marker(session).await
        } else {
            session.has_element(&self.marker).await
        };
        if !marker_found {
            let missing = ScrapeError::StructuralMarkerMissing {
                address: address.to_string(),
                marker: self.marker.clone(),
            };
            warn!("{}", missing);
        }

        let html = session.content().await?;
        debug!(address, bytes = html.len(), marker_found, "fetched");
        Ok(RenderedDocument {
            address: address.to_string(),
            html,
            marker_found,
        })
    }

    async fn wait_for_marker(&self, session: &mut dyn Session) -> bool {
        let deadline = Instant::now() + self.element_timeout;
        loop {
            if session.has_element(&self.marker).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(MARKER_POLL.min(deadline - now)).await;
        }
    }
}

// ── Tests ──
