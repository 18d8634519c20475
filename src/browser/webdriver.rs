use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use thirtyfour::components::SelectElement;
use thirtyfour::prelude::*;
use thirtyfour::WindowHandle;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::cli::config::BrowserSettings;
use crate::crawler::element::{DetectionReport, Scrollability};
use crate::crawler::error::{CrawlError, TimeoutScope};

use super::{BrowserAdapter, LocateOutcome, PageHandle};

/// Default in-page detector. Walks the DOM for interactive elements and
/// reports each with an absolute XPath and a suggested interaction verb.
const DETECTOR_SCRIPT: &str = r#"
function xpathOf(el) {
    if (el === document.body) return '/html/body';
    if (!el.parentNode) return '';
    var idx = 1;
    var sibs = el.parentNode.childNodes;
    for (var i = 0; i < sibs.length; i++) {
        var sib = sibs[i];
        if (sib === el) {
            return xpathOf(el.parentNode) + '/' + el.tagName.toLowerCase() + '[' + idx + ']';
        }
        if (sib.nodeType === 1 && sib.tagName === el.tagName) idx++;
    }
    return '';
}
function verbFor(el) {
    var tag = el.tagName.toLowerCase();
    if (tag === 'select') return 'selectOption';
    if (tag === 'textarea') return 'fill';
    if (tag === 'input') {
        var type = (el.getAttribute('type') || 'text').toLowerCase();
        if (type === 'checkbox') return el.checked ? 'uncheck' : 'check';
        if (type === 'radio') return 'check';
        if (['button', 'submit', 'reset', 'image'].indexOf(type) >= 0) return 'click';
        return 'fill';
    }
    return 'click';
}
var selector = 'a[href], button, input, select, textarea, [onclick], [role=button]';
var out = [];
var seen = {};
var nodes = document.querySelectorAll(selector);
for (var i = 0; i < nodes.length; i++) {
    var el = nodes[i];
    var rect = el.getBoundingClientRect();
    if (rect.width === 0 || rect.height === 0) continue;
    if (rect.bottom < 0 || rect.top > window.innerHeight) continue;
    var path = xpathOf(el);
    if (!path || seen[path]) continue;
    seen[path] = true;
    var attrs = {};
    for (var j = 0; j < el.attributes.length; j++) {
        attrs[el.attributes[j].name] = el.attributes[j].value;
    }
    out.push({
        elementPath: path,
        tagName: el.tagName.toLowerCase(),
        attributes: attrs,
        playwrightInteraction: { action: verbFor(el) }
    });
}
return {
    interactiveElements: out,
    websiteInfo: { title: document.title, url: window.location.href },
    viewportSize: { width: window.innerWidth, height: window.innerHeight },
    scrollPosition: { x: window.scrollX, y: window.scrollY }
};
"#;

const SCROLL_METRICS_SCRIPT: &str = r#"
return {
    scrollHeight: Math.max(document.body.scrollHeight, document.documentElement.scrollHeight),
    innerHeight: window.innerHeight,
    scrollY: window.scrollY
};
"#;

fn interaction_err(context: &str, e: impl std::fmt::Display) -> CrawlError {
    CrawlError::Interaction(format!("{context}: {e}"))
}

/// WebDriver-backed browser adapter.
///
/// One driver process, one window handle per page. The driver protocol is
/// single-threaded, so every operation takes the driver mutex, switches to
/// its window, and releases the lock when done.
pub struct WebdriverBrowser {
    driver: Arc<Mutex<WebDriver>>,
    detector: Arc<String>,
}

impl WebdriverBrowser {
    /// Connect to the WebDriver endpoint and apply viewport settings
    pub async fn connect(config: &BrowserSettings) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg(&format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ))?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--no-first-run")?;
        if config.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&config.webdriver_url, caps)
            .await
            .context(format!("Failed to connect to WebDriver at {}", config.webdriver_url))?;

        driver
            .set_page_load_timeout(Duration::from_millis(config.navigation_timeout_ms))
            .await?;

        let detector = match &config.detector_path {
            Some(path) => std::fs::read_to_string(path)
                .context(format!("Failed to read detector script: {}", path.display()))?,
            None => DETECTOR_SCRIPT.to_string(),
        };

        debug!(url = %config.webdriver_url, "WebDriver session established");

        Ok(Self {
            driver: Arc::new(Mutex::new(driver)),
            detector: Arc::new(detector),
        })
    }

    /// Quit the underlying driver
    pub async fn shutdown(&self) -> Result<()> {
        let driver = self.driver.lock().await;
        driver.clone().quit().await.context("Failed to quit WebDriver")?;
        Ok(())
    }

    fn page(&self, handle: WindowHandle) -> WdPage {
        WdPage {
            id: String::from(handle.clone()),
            handle,
            driver: Arc::clone(&self.driver),
            detector: Arc::clone(&self.detector),
        }
    }
}

#[async_trait]
impl BrowserAdapter for WebdriverBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, CrawlError> {
        let driver = self.driver.lock().await;
        let handle = driver
            .new_tab()
            .await
            .map_err(|e| interaction_err("failed to open page", e))?;
        drop(driver);
        Ok(Box::new(self.page(handle)))
    }

    async fn attach(&self, page_id: &str) -> Result<Box<dyn PageHandle>, CrawlError> {
        let handle = WindowHandle::try_from(page_id.to_string())
            .map_err(|_| CrawlError::Interaction(format!("invalid page id: {page_id}")))?;
        Ok(Box::new(self.page(handle)))
    }

    async fn pages(&self) -> Result<Vec<String>, CrawlError> {
        let driver = self.driver.lock().await;
        let handles = driver
            .windows()
            .await
            .map_err(|e| interaction_err("failed to list pages", e))?;
        Ok(handles.into_iter().map(String::from).collect())
    }

    async fn wait_for_new_page(
        &self,
        known: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, CrawlError> {
        // The classic WebDriver protocol has no window-open event, so this
        // arm polls the handle list on a short interval.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.pages().await?;
            if let Some(new_id) = current.iter().find(|id| !known.contains(id)) {
                return Ok(Some(new_id.clone()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn close_page(&self, page_id: &str) -> Result<(), CrawlError> {
        // An unparseable id means the page is already gone
        let Ok(handle) = WindowHandle::try_from(page_id.to_string()) else {
            return Ok(());
        };
        let driver = self.driver.lock().await;
        if driver.switch_to_window(handle).await.is_ok() {
            if let Err(e) = driver.close_window().await {
                warn!(page = page_id, error = %e, "failed to close page");
            }
        }
        // Leave the driver focused on some surviving window
        if let Ok(handles) = driver.windows().await {
            if let Some(first) = handles.into_iter().next() {
                let _ = driver.switch_to_window(first).await;
            }
        }
        Ok(())
    }
}

struct WdPage {
    id: String,
    handle: WindowHandle,
    driver: Arc<Mutex<WebDriver>>,
    detector: Arc<String>,
}

impl WdPage {
    /// Lock the driver and focus this page's window
    async fn focused(&self) -> Result<tokio::sync::MutexGuard<'_, WebDriver>, CrawlError> {
        let driver = self.driver.lock().await;
        driver
            .switch_to_window(self.handle.clone())
            .await
            .map_err(|e| interaction_err("failed to switch to page", e))?;
        Ok(driver)
    }

    async fn find(
        &self,
        driver: &WebDriver,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<WebElement>, CrawlError> {
        let found = driver
            .query(By::XPath(path))
            .wait(timeout, Duration::from_millis(500))
            .all()
            .await
            .map_err(|e| interaction_err("element query failed", e))?;
        Ok(found.into_iter().next())
    }
}

#[async_trait]
impl PageHandle for WdPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        // The WebDriver protocol does not expose the HTTP status, so a 404
        // page that renders counts as a successful navigation here
        let driver = self.focused().await?;
        driver
            .goto(url)
            .await
            .map_err(|e| CrawlError::Navigation(format!("{url}: {e}")))
    }

    async fn current_url(&self) -> Result<String, CrawlError> {
        let driver = self.focused().await?;
        let url = driver
            .current_url()
            .await
            .map_err(|e| interaction_err("failed to read current url", e))?;
        Ok(url.to_string())
    }

    async fn is_loading(&self) -> Result<bool, CrawlError> {
        let driver = self.focused().await?;
        let ret = driver
            .execute("return document.readyState;", Vec::new())
            .await
            .map_err(|e| interaction_err("failed to read ready state", e))?;
        let state = ret.json().clone();
        Ok(state.as_str() != Some("complete"))
    }

    async fn screenshot(&self, _quality: u8) -> Result<Vec<u8>, CrawlError> {
        // WebDriver screenshots are PNG; the quality hint has no effect here
        let driver = self.focused().await?;
        driver
            .screenshot_as_png()
            .await
            .map_err(|e| interaction_err("screenshot failed", e))
    }

    async fn detect_elements(&self, timeout: Duration) -> Result<DetectionReport, CrawlError> {
        let driver = self.focused().await?;
        let detection = tokio::time::timeout(timeout, driver.execute(&self.detector, Vec::new()))
            .await
            .map_err(|_| CrawlError::Timeout {
                scope: TimeoutScope::Detection,
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| interaction_err("detector script failed", e))?;

        let value = detection.json().clone();
        serde_json::from_value(value)
            .map_err(|e| interaction_err("detector payload did not parse", e))
    }

    async fn scrollability(&self, max_viewports: usize) -> Result<Scrollability, CrawlError> {
        let driver = self.focused().await?;
        let ret = driver
            .execute(SCROLL_METRICS_SCRIPT, Vec::new())
            .await
            .map_err(|e| interaction_err("scroll metrics failed", e))?;
        let metrics = ret.json().clone();

        let scroll_height = metrics
            .get("scrollHeight")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let inner_height = metrics
            .get("innerHeight")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(1);
        let scroll_y = metrics.get("scrollY").and_then(|v| v.as_i64()).unwrap_or(0);

        let total = ((scroll_height + inner_height - 1) / inner_height).max(1) as usize;
        let capped = total.min(max_viewports.max(1));
        let offsets: Vec<i64> = (0..capped).map(|i| i as i64 * inner_height).collect();

        Ok(Scrollability {
            can_scroll: total > 1,
            total_viewports: total,
            current_position: scroll_y,
            viewport_offsets: offsets,
        })
    }

    async fn scroll_to(&self, offset: i64) -> Result<(), CrawlError> {
        let driver = self.focused().await?;
        driver
            .execute(
                "window.scrollTo({top: arguments[0], behavior: 'smooth'});",
                vec![json!(offset)],
            )
            .await
            .map_err(|e| interaction_err("scroll failed", e))?;
        Ok(())
    }

    async fn scroll_into_view(&self, path: &str) -> Result<(), CrawlError> {
        let driver = self.focused().await?;
        match self.find(&driver, path, Duration::from_secs(2)).await? {
            Some(element) => element
                .scroll_into_view()
                .await
                .map_err(|e| interaction_err("scroll into view failed", e)),
            None => Err(CrawlError::Interaction(format!(
                "element not found for scroll: {path}"
            ))),
        }
    }

    async fn locate(&self, path: &str, timeout: Duration) -> Result<LocateOutcome, CrawlError> {
        let driver = self.focused().await?;
        match self.find(&driver, path, timeout).await? {
            Some(element) => {
                let displayed = element.is_displayed().await.unwrap_or(false);
                if displayed {
                    Ok(LocateOutcome::Found)
                } else {
                    Ok(LocateOutcome::NotVisible)
                }
            }
            None => Ok(LocateOutcome::Timeout),
        }
    }

    async fn fill(&self, path: &str, value: &str) -> Result<(), CrawlError> {
        let driver = self.focused().await?;
        let element = self
            .find(&driver, path, Duration::from_secs(2))
            .await?
            .ok_or_else(|| CrawlError::Interaction(format!("element vanished: {path}")))?;
        let _ = element.clear().await;
        element
            .send_keys(value)
            .await
            .map_err(|e| interaction_err("fill failed", e))
    }

    async fn set_checked(&self, path: &str, checked: bool) -> Result<(), CrawlError> {
        let driver = self.focused().await?;
        let element = self
            .find(&driver, path, Duration::from_secs(2))
            .await?
            .ok_or_else(|| CrawlError::Interaction(format!("element vanished: {path}")))?;
        let selected = element
            .is_selected()
            .await
            .map_err(|e| interaction_err("checked-state read failed", e))?;
        if selected != checked {
            element
                .click()
                .await
                .map_err(|e| interaction_err("toggle failed", e))?;
        }
        Ok(())
    }

    async fn select_option(&self, path: &str) -> Result<Option<String>, CrawlError> {
        let driver = self.focused().await?;
        let element = self
            .find(&driver, path, Duration::from_secs(2))
            .await?
            .ok_or_else(|| CrawlError::Interaction(format!("element vanished: {path}")))?;

        let select = SelectElement::new(&element)
            .await
            .map_err(|e| interaction_err("not a select element", e))?;
        let options = select
            .options()
            .await
            .map_err(|e| interaction_err("failed to read options", e))?;
        if options.is_empty() {
            return Ok(None);
        }

        // Skip a leading placeholder when there is a real choice
        let index = if options.len() > 1 { 1 } else { 0 };
        let label = options[index].text().await.unwrap_or_default();
        select
            .select_by_index(index as u32)
            .await
            .map_err(|e| interaction_err("select failed", e))?;
        Ok(Some(label))
    }

    async fn click(&self, path: &str) -> Result<(), CrawlError> {
        let driver = self.focused().await?;
        let element = self
            .find(&driver, path, Duration::from_secs(2))
            .await?
            .ok_or_else(|| CrawlError::Interaction(format!("element vanished: {path}")))?;

        if let Err(first) = element.click().await {
            // Overlays intercept native clicks on some pages; fall back to a
            // script click before giving up
            let arg = element
                .to_json()
                .map_err(|e| interaction_err("click failed", e))?;
            driver
                .execute("arguments[0].click();", vec![arg])
                .await
                .map_err(|_| interaction_err("click failed", first))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CrawlError> {
        let driver = self.driver.lock().await;
        if driver.switch_to_window(self.handle.clone()).await.is_ok() {
            if let Err(e) = driver.close_window().await {
                error!(page = %self.id, error = %e, "failed to close page");
            }
        }
        if let Ok(handles) = driver.windows().await {
            if let Some(first) = handles.into_iter().next() {
                let _ = driver.switch_to_window(first).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ids_round_trip_through_window_handles() {
        let handle = WindowHandle::try_from("CDwindow-ABC123".to_string()).unwrap();
        assert_eq!(String::from(handle), "CDwindow-ABC123");

        // The protocol reserves this name; it can never identify a page
        assert!(WindowHandle::try_from("current".to_string()).is_err());
    }

    #[test]
    fn scrollability_offsets_cover_the_page() {
        // Mirror of the offset computation in `scrollability`
        let scroll_height = 3000i64;
        let inner_height = 768i64;
        let total = ((scroll_height + inner_height - 1) / inner_height).max(1) as usize;
        assert_eq!(total, 4);
        let capped = total.min(9);
        let offsets: Vec<i64> = (0..capped).map(|i| i as i64 * inner_height).collect();
        assert_eq!(offsets, vec![0, 768, 1536, 2304]);
    }
}
