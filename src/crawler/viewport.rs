use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::browser::PageHandle;
use crate::storage::ArtifactStore;

use super::element::{merge_element, ElementDescriptor, Scrollability};
use super::urls::extract_urls;

const DETECTION_TIMEOUT: Duration = Duration::from_secs(30);
const LAZY_LOAD_PAUSE: Duration = Duration::from_millis(1000);

/// What one page yielded across all visited viewports
#[derive(Debug, Default)]
pub struct ViewportSweep {
    /// Elements merged across viewports, keyed by element path
    pub elements: HashMap<String, ElementDescriptor>,
    pub discovered_urls: Vec<String>,
    pub viewport_count: usize,
}

/// Walks a page viewport by viewport, detecting elements and capturing
/// evidence at each stop.
///
/// Per-viewport failures are logged and skipped; the sweep itself never
/// fails.
pub struct ViewportExplorer {
    max_viewports: usize,
    screenshot_quality: u8,
}

impl ViewportExplorer {
    pub fn new(max_viewports: usize, screenshot_quality: u8) -> Self {
        Self {
            max_viewports: max_viewports.max(1),
            screenshot_quality,
        }
    }

    pub async fn explore(
        &self,
        page: &dyn PageHandle,
        store: &ArtifactStore,
        domain: &str,
        url: &str,
        scroll: &Scrollability,
    ) -> ViewportSweep {
        let mut sweep = ViewportSweep::default();

        let total = scroll
            .viewport_offsets
            .len()
            .min(scroll.total_viewports)
            .min(self.max_viewports)
            .max(1);

        for (index, offset) in scroll.viewport_offsets.iter().take(total).enumerate() {
            let viewport_number = index + 1;

            // The first viewport is already on screen; only scroll for the rest
            if viewport_number > 1 {
                if let Err(e) = page.scroll_to(*offset).await {
                    warn!(url, viewport = viewport_number, error = %e, "scroll failed, skipping viewport");
                    continue;
                }
                tokio::time::sleep(LAZY_LOAD_PAUSE).await;
            }

            let report = match page.detect_elements(DETECTION_TIMEOUT).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(url, viewport = viewport_number, error = %e, "detection failed, treating viewport as empty");
                    Default::default()
                }
            };

            sweep.viewport_count = viewport_number;

            let screenshot = match page.screenshot(self.screenshot_quality).await {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(url, viewport = viewport_number, error = %e, "viewport screenshot failed");
                    None
                }
            };

            let report_json =
                serde_json::to_value(&report).unwrap_or(serde_json::Value::Null);
            if let Err(e) = store
                .store_viewport(domain, url, viewport_number, screenshot.as_deref(), report_json)
                .await
            {
                warn!(url, viewport = viewport_number, error = %e, "viewport artifact not stored");
            }

            for candidate in extract_urls(&report.interactive_elements, url) {
                sweep.discovered_urls.push(candidate);
            }
            for element in report.interactive_elements {
                merge_element(&mut sweep.elements, element);
            }

            debug!(
                url,
                viewport = viewport_number,
                elements = sweep.elements.len(),
                "viewport processed"
            );
        }

        // Interactions start from the top of the page
        if let Err(e) = page.scroll_to(0).await {
            warn!(url, error = %e, "failed to scroll back to top");
        }

        sweep
    }
}
