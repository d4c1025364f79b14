//! Shared headless Chrome session for sites that render listings client-side.
//!
//! `headless_chrome` is a blocking API, so every browser call runs on the
//! blocking pool. The browser is launched on first use and relaunched after it
//! stops answering.

use std::thread;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RegionConfig;
use crate::error::ScrapeError;

const SCROLL_PASSES: usize = 5;
const CARD_WAIT: Duration = Duration::from_secs(30);
/// Reruns are minutes apart; the browser must survive the gap
const IDLE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Markers of anti-bot interstitials served instead of results
const BLOCK_MARKERS: [&str; 4] = ["px-captcha", "Access Denied", "Zugriff verweigert", "cf-challenge"];

/// What to wait for and click on a results page
#[derive(Debug, Clone, Copy)]
pub struct PageSpec {
    pub source_name: &'static str,
    /// Present once result cards have rendered
    pub card_selector: &'static str,
    /// Cookie banner button, clicked if present
    pub consent_selector: Option<&'static str>,
}

pub struct BrowserSession {
    headless: bool,
    user_agent: Option<String>,
    proxy: Option<String>,
    timeout: Duration,
    browser: Mutex<Option<Browser>>,
}

impl BrowserSession {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            headless: config.headless,
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            timeout: config.request_timeout(),
            browser: Mutex::new(None),
        }
    }

    async fn browser(&self) -> Result<Browser, ScrapeError> {
        let mut slot = self.browser.lock().await;
        if let Some(browser) = slot.as_ref() {
            return Ok(browser.clone());
        }

        let headless = self.headless;
        let proxy = self.proxy.clone();
        let browser = tokio::task::spawn_blocking(move || launch(headless, proxy.as_deref()))
            .await
            .map_err(|e| ScrapeError::Browser(format!("launch task failed: {e}")))??;
        *slot = Some(browser.clone());
        Ok(browser)
    }

    /// Forget `browser` if it no longer answers, so the next fetch relaunches it.
    async fn check_alive(&self, browser: Browser) {
        let alive = tokio::task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .unwrap_or(false);
        if !alive {
            warn!("Browser stopped responding, it will be relaunched");
            self.browser.lock().await.take();
        }
    }

    /// Load `url`, let the result cards render, and return the page HTML.
    pub async fn fetch_html(&self, url: &str, page: PageSpec) -> Result<String, ScrapeError> {
        let browser = self.browser().await?;
        let url = url.to_string();
        let user_agent = self.user_agent.clone();
        let timeout = self.timeout;

        let rendering = browser.clone();
        let result = tokio::task::spawn_blocking(move || {
            render(&rendering, &url, page, user_agent.as_deref(), timeout)
        })
        .await
        .map_err(|e| ScrapeError::Browser(format!("render task failed: {e}")))
        .and_then(|rendered| rendered);

        let html = match result {
            Ok(html) => html,
            Err(e) => {
                self.check_alive(browser).await;
                return Err(e);
            }
        };

        if is_blocked(&html) {
            warn!(source = page.source_name, "Results page is an anti-bot interstitial");
            return Err(ScrapeError::RateLimited {
                source_name: page.source_name,
                retry_after: None,
            });
        }
        Ok(html)
    }
}

fn browser_error(context: &str, e: impl std::fmt::Display) -> ScrapeError {
    ScrapeError::Browser(format!("{context}: {e}"))
}

fn launch(headless: bool, proxy: Option<&str>) -> Result<Browser, ScrapeError> {
    info!(headless, "Launching headless Chrome...");

    let options = LaunchOptions::default_builder()
        .headless(headless)
        .window_size(Some((1920, 1080)))
        .proxy_server(proxy)
        .idle_browser_timeout(IDLE_TIMEOUT)
        .build()
        .map_err(|e| browser_error("Failed to build launch options", e))?;

    Browser::new(options).map_err(|e| browser_error("Failed to launch Chrome browser", e))
}

/// Render `url` in a fresh tab. The tab is closed whether or not rendering succeeds.
fn render(
    browser: &Browser,
    url: &str,
    page: PageSpec,
    user_agent: Option<&str>,
    timeout: Duration,
) -> Result<String, ScrapeError> {
    let tab = browser.new_tab().map_err(|e| browser_error("Failed to open tab", e))?;
    let html = render_in(&tab, url, page, user_agent, timeout);
    if let Err(e) = tab.close(true) {
        debug!(url, error = %e, "Failed to close tab");
    }
    html
}

fn render_in(
    tab: &Tab,
    url: &str,
    page: PageSpec,
    user_agent: Option<&str>,
    timeout: Duration,
) -> Result<String, ScrapeError> {
    tab.set_default_timeout(timeout);
    if let Some(ua) = user_agent {
        tab.set_user_agent(ua, None, None)
            .map_err(|e| browser_error("Failed to set user agent", e))?;
    }

    debug!(url, "Navigating");
    tab.navigate_to(url)
        .and_then(|t| t.wait_until_navigated())
        .map_err(|e| browser_error("Navigation failed", e))?;

    if let Some(consent) = page.consent_selector {
        if let Ok(button) = tab.find_element(consent) {
            let _ = button.click();
            thread::sleep(Duration::from_secs(1));
        }
    }

    if tab
        .wait_for_element_with_custom_timeout(page.card_selector, timeout.min(CARD_WAIT))
        .is_err()
    {
        warn!(url, "No result cards rendered; the page may not have loaded");
    }

    // Lazy-loaded cards only render once scrolled into view
    for _ in 0..SCROLL_PASSES {
        let _ = tab.evaluate("window.scrollTo(0, document.body.scrollHeight)", false);
        thread::sleep(Duration::from_millis(500));
        let _ = tab.evaluate("window.scrollTo(0, 0)", false);
    }

    let html = tab
        .get_content()
        .map_err(|e| browser_error("Failed to read page HTML", e))?;

    debug!(url, bytes = html.len(), "Captured page HTML");
    Ok(html)
}

fn is_blocked(html: &str) -> bool {
    BLOCK_MARKERS.iter().any(|marker| html.contains(marker))
}
