use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::browser::{BrowserAdapter, PageHandle};
use crate::cli::config::CrawlerConfig;
use crate::forms::FormValueProvider;
use crate::storage::ArtifactStore;

use super::element::{group_by_verb, InteractionVerb, Scrollability, UrlOutcome};
use super::error::CrawlError;
use super::interaction::{BatchEnd, InteractionBudget, InteractionEngine, InteractionSession};
use super::viewport::ViewportExplorer;

/// Fixed dispatch order: form state is established before anything that can
/// navigate away from the page.
const VERB_ORDER: [InteractionVerb; 7] = [
    InteractionVerb::Fill,
    InteractionVerb::Check,
    InteractionVerb::Uncheck,
    InteractionVerb::SelectOption,
    InteractionVerb::Click,
    InteractionVerb::Hover,
    InteractionVerb::Drag,
];

/// Processes one URL end to end: navigate, sweep viewports, exercise
/// elements, collect discoveries. Always returns an outcome; the page is
/// closed on every path including timeouts.
pub struct UrlProcessor<'a> {
    pub adapter: &'a dyn BrowserAdapter,
    pub store: &'a ArtifactStore,
    pub forms: &'a FormValueProvider,
    pub config: &'a CrawlerConfig,
}

impl<'a> UrlProcessor<'a> {
    pub async fn process(&self, url: &str, domain: &str, is_discovered: bool) -> UrlOutcome {
        let page = match self.adapter.new_page().await {
            Ok(page) => page,
            Err(e) => {
                warn!(url, error = %e, "could not open a page");
                return UrlOutcome::failed(url, domain, is_discovered, e.to_string());
            }
        };

        // Shared with the interaction engine so a popup open at cancellation
        // time can still be cleaned up here
        let popup_slot = std::sync::Mutex::new(None);

        let budget = Duration::from_secs(self.config.crawler.url_timeout_secs);
        let outcome = match tokio::time::timeout(
            budget,
            self.run(page.as_ref(), url, domain, is_discovered, &popup_slot),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.store_failure_evidence(page.as_ref(), domain, url, &e.to_string())
                    .await;
                UrlOutcome::failed(url, domain, is_discovered, e.to_string())
            }
            Err(_) => {
                let e = CrawlError::url_timeout(self.config.crawler.url_timeout_secs);
                warn!(url, "url processing timed out");
                self.store_failure_evidence(page.as_ref(), domain, url, &e.to_string())
                    .await;
                UrlOutcome::failed(url, domain, is_discovered, e.to_string())
            }
        };

        let leftover = popup_slot.lock().ok().and_then(|mut slot| slot.take());
        if let Some(popup_id) = leftover {
            if let Err(e) = self.adapter.close_page(&popup_id).await {
                warn!(url, popup = %popup_id, error = %e, "failed to close leftover popup");
            }
        }

        if let Err(e) = page.close().await {
            warn!(url, error = %e, "failed to close page");
        }

        outcome
    }

    async fn run(
        &self,
        page: &dyn PageHandle,
        url: &str,
        domain: &str,
        is_discovered: bool,
        popup_slot: &std::sync::Mutex<Option<String>>,
    ) -> Result<UrlOutcome, CrawlError> {
        page.navigate(url).await?;

        let scroll = match page
            .scrollability(self.config.crawler.max_viewports_per_url)
            .await
        {
            Ok(scroll) => scroll,
            Err(e) => {
                // Degrade to a single non-scrollable viewport
                debug!(url, error = %e, "scrollability probe failed");
                Scrollability::default()
            }
        };

        let explorer = ViewportExplorer::new(
            self.config.crawler.max_viewports_per_url,
            self.config.storage.screenshot_quality,
        );
        let sweep = explorer
            .explore(page, self.store, domain, url, &scroll)
            .await;

        if sweep.elements.is_empty() && self.config.crawler.no_elements_is_failure {
            return Err(CrawlError::NoInteractiveSurface);
        }

        let mut discovered: Vec<String> = sweep.discovered_urls.clone();

        let engine = InteractionEngine {
            adapter: self.adapter,
            store: self.store,
            forms: self.forms,
            settings: &self.config.crawler,
            screenshot_quality: self.config.storage.screenshot_quality,
            popup_slot,
        };
        let mut session =
            InteractionSession::new(InteractionBudget::from_settings(&self.config.crawler));

        let groups = group_by_verb(&sweep.elements);
        'verbs: for verb in VERB_ORDER {
            let Some(batch) = groups.get(&verb) else {
                continue;
            };
            // Stable order within a verb keeps runs comparable
            let mut batch: Vec<_> = batch.clone();
            batch.sort_by(|a, b| a.element_path.cmp(&b.element_path));

            match engine
                .run_batch(page, domain, url, verb, &batch, &mut session)
                .await
            {
                Ok(BatchEnd::GlobalExhausted) => break 'verbs,
                Ok(BatchEnd::Completed) | Ok(BatchEnd::CategoryExhausted) => {}
                Err(e) => {
                    warn!(url, error = %e, "interaction batch aborted");
                    break 'verbs;
                }
            }
        }

        discovered.extend(session.discovered_urls.iter().cloned());

        let mut elements: Vec<_> = sweep.elements.into_values().collect();
        elements.sort_by(|a, b| a.element_path.cmp(&b.element_path));

        info!(
            url,
            elements = elements.len(),
            interactions = session.interactions_count(),
            viewports = sweep.viewport_count,
            "url processed"
        );

        Ok(UrlOutcome {
            url: url.to_string(),
            domain: domain.to_string(),
            success: true,
            error: None,
            elements,
            discovered_urls: discovered,
            interactions_count: session.interactions_count(),
            viewport_count: sweep.viewport_count,
            timestamp: Utc::now(),
            is_discovered,
        })
    }

    async fn store_failure_evidence(
        &self,
        page: &dyn PageHandle,
        domain: &str,
        url: &str,
        error: &str,
    ) {
        let screenshot = page
            .screenshot(self.config.storage.screenshot_quality)
            .await
            .ok();
        if let Err(e) = self
            .store
            .store_error(domain, url, error, screenshot.as_deref())
            .await
        {
            warn!(url, error = %e, "error evidence not stored");
        }
    }
}
