pub mod webdriver;

use std::time::Duration;

use async_trait::async_trait;

use crate::crawler::element::{DetectionReport, Scrollability};
use crate::crawler::error::CrawlError;

pub use webdriver::WebdriverBrowser;

/// Result of trying to resolve an element by its path.
///
/// `NotVisible` and `Timeout` are expected states, not errors; the caller
/// decides whether either fails the interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    Found,
    NotVisible,
    Timeout,
}

/// Driver-level surface: page lifecycle plus popup observation.
///
/// Pages are identified by opaque string ids so the crawl logic never touches
/// driver-specific handle types.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Open a fresh page and return a handle to it
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, CrawlError>;

    /// Attach to an already-open page, typically a popup
    async fn attach(&self, page_id: &str) -> Result<Box<dyn PageHandle>, CrawlError>;

    /// Snapshot of every open page id
    async fn pages(&self) -> Result<Vec<String>, CrawlError>;

    /// Wait for a page not in `known` to appear, up to the timeout.
    /// Returns the new page id, or `None` when nothing opened.
    async fn wait_for_new_page(
        &self,
        known: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, CrawlError>;

    /// Close a page by id; closing an already-gone page is not an error
    async fn close_page(&self, page_id: &str) -> Result<(), CrawlError>;
}

/// One open page. All interaction verbs address elements by path.
#[async_trait]
pub trait PageHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str) -> Result<(), CrawlError>;

    async fn current_url(&self) -> Result<String, CrawlError>;

    /// Whether the document is still loading
    async fn is_loading(&self) -> Result<bool, CrawlError>;

    /// Capture the visible viewport. The quality hint applies where the
    /// backend supports it; a PNG-only backend ignores it.
    async fn screenshot(&self, quality: u8) -> Result<Vec<u8>, CrawlError>;

    /// Run the injected element detector against the current viewport
    async fn detect_elements(&self, timeout: Duration) -> Result<DetectionReport, CrawlError>;

    /// Probe vertical scrollability and precompute viewport offsets
    async fn scrollability(&self, max_viewports: usize) -> Result<Scrollability, CrawlError>;

    /// Smooth-scroll to an absolute vertical offset
    async fn scroll_to(&self, offset: i64) -> Result<(), CrawlError>;

    async fn scroll_into_view(&self, path: &str) -> Result<(), CrawlError>;

    async fn locate(&self, path: &str, timeout: Duration) -> Result<LocateOutcome, CrawlError>;

    async fn fill(&self, path: &str, value: &str) -> Result<(), CrawlError>;

    async fn set_checked(&self, path: &str, checked: bool) -> Result<(), CrawlError>;

    /// Pick an option on a select element; returns the chosen option's label
    async fn select_option(&self, path: &str) -> Result<Option<String>, CrawlError>;

    async fn click(&self, path: &str) -> Result<(), CrawlError>;

    async fn close(&self) -> Result<(), CrawlError>;
}
