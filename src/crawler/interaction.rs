use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::browser::{BrowserAdapter, LocateOutcome, PageHandle};
use crate::cli::config::CrawlSettings;
use crate::forms::FormValueProvider;
use crate::storage::ArtifactStore;

use super::element::{
    ElementDescriptor, InteractionRecord, InteractionVerb, PopupCapture, RedirectEdge,
};
use super::error::CrawlError;
use super::urls::extract_urls;

const LOCATE_TIMEOUT: Duration = Duration::from_secs(5);
const POPUP_DETECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATE_DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const AFTER_STATE_EXTRA_WAIT: Duration = Duration::from_secs(2);

/// Interaction ceilings for one URL
#[derive(Debug, Clone, Copy)]
pub struct InteractionBudget {
    pub max_total: usize,
    pub max_click: usize,
    pub max_form: usize,
}

impl InteractionBudget {
    pub fn from_settings(settings: &CrawlSettings) -> Self {
        Self {
            max_total: settings.max_interactions_per_url,
            max_click: settings.max_click_interactions_per_url,
            max_form: settings.max_form_interactions_per_url,
        }
    }
}

/// Outcome of a budget check before an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Proceed,
    CategoryExhausted,
    GlobalExhausted,
}

/// How one verb batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    Completed,
    CategoryExhausted,
    GlobalExhausted,
}

/// Mutable context threaded through every interaction on one URL: budget
/// counters, the set of already-exercised elements, and everything collected
/// along the way.
pub struct InteractionSession {
    budget: InteractionBudget,
    total: usize,
    clicks: usize,
    forms: usize,
    interacted: HashSet<String>,
    pub records: Vec<InteractionRecord>,
    pub discovered_urls: Vec<String>,
}

impl InteractionSession {
    pub fn new(budget: InteractionBudget) -> Self {
        Self {
            budget,
            total: 0,
            clicks: 0,
            forms: 0,
            interacted: HashSet::new(),
            records: Vec::new(),
            discovered_urls: Vec::new(),
        }
    }

    /// Global ceiling first, then the verb's category ceiling
    pub fn check(&self, verb: InteractionVerb) -> BudgetCheck {
        if self.total >= self.budget.max_total {
            return BudgetCheck::GlobalExhausted;
        }
        let category_spent = if verb.is_form_style() {
            self.forms >= self.budget.max_form
        } else {
            self.clicks >= self.budget.max_click
        };
        if category_spent {
            BudgetCheck::CategoryExhausted
        } else {
            BudgetCheck::Proceed
        }
    }

    pub fn already_done(&self, element_path: &str) -> bool {
        self.interacted.contains(element_path)
    }

    fn note(&mut self, verb: InteractionVerb, element_path: &str) {
        self.total += 1;
        if verb.is_form_style() {
            self.forms += 1;
        } else {
            self.clicks += 1;
        }
        self.interacted.insert(element_path.to_string());
    }

    pub fn interactions_count(&self) -> usize {
        self.total
    }
}

/// Exercises elements one by one: locate, capture the before state, perform
/// the verb, contain popups and redirects, capture the after state, record.
pub struct InteractionEngine<'a> {
    pub adapter: &'a dyn BrowserAdapter,
    pub store: &'a ArtifactStore,
    pub forms: &'a FormValueProvider,
    pub settings: &'a CrawlSettings,
    pub screenshot_quality: u8,
    /// Id of a popup currently being contained. Lives outside the engine so
    /// the caller can still close the popup after cancelling a batch mid-way.
    pub popup_slot: &'a std::sync::Mutex<Option<String>>,
}

impl<'a> InteractionEngine<'a> {
    /// Run one verb batch against the page.
    ///
    /// Failed elements are recorded and skipped, never retried. The only
    /// error returned is a failed return-to-original navigation, which makes
    /// the rest of the page untrustworthy and aborts remaining batches.
    pub async fn run_batch(
        &self,
        page: &dyn PageHandle,
        domain: &str,
        url: &str,
        verb: InteractionVerb,
        elements: &[ElementDescriptor],
        session: &mut InteractionSession,
    ) -> Result<BatchEnd, CrawlError> {
        for element in elements {
            match session.check(verb) {
                BudgetCheck::GlobalExhausted => {
                    info!(url, "interaction budget exhausted");
                    return Ok(BatchEnd::GlobalExhausted);
                }
                BudgetCheck::CategoryExhausted => {
                    debug!(url, verb = verb.as_str(), "category budget exhausted");
                    return Ok(BatchEnd::CategoryExhausted);
                }
                BudgetCheck::Proceed => {}
            }

            if session.already_done(&element.element_path) {
                continue;
            }

            if let Err(e) = page.scroll_into_view(&element.element_path).await {
                debug!(url, element = %element.short_id(), error = %e, "scroll into view failed, skipping");
                continue;
            }

            match page.locate(&element.element_path, LOCATE_TIMEOUT).await? {
                LocateOutcome::Found => {}
                outcome => {
                    debug!(url, element = %element.short_id(), ?outcome, "element not interactable, skipping");
                    continue;
                }
            }

            self.capture_state(page, domain, url, element, "before", None)
                .await;

            let pages_before = self.adapter.pages().await.unwrap_or_default();
            let original_url = page.current_url().await.unwrap_or_else(|_| url.to_string());

            let performed = self.perform(page, verb, element).await;
            let (success, error, form_value) = match &performed {
                Ok(value) => (true, None, value.clone()),
                Err(e) => (false, Some(e.to_string()), None),
            };

            let mut popup = None;
            let mut redirects = Vec::new();
            if success {
                if !verb.is_form_style() {
                    popup = self.contain_popup(domain, url, &pages_before).await;
                    if let Some(capture) = &popup {
                        session
                            .discovered_urls
                            .extend(capture.discovered_urls.iter().cloned());
                    }
                }
                redirects = self.track_redirects(page, &original_url).await;

                if let Some(last) = redirects.last() {
                    if last.to_url != original_url && self.settings.return_to_original_url {
                        if let Err(e) = page.navigate(&original_url).await {
                            warn!(url, error = %e, "could not return to original url, aborting batch");
                            session.records.push(self.record(
                                element, verb, false,
                                Some(format!("return to original url failed: {e}")),
                                redirects, popup, form_value, None,
                            ));
                            session.note(verb, &element.element_path);
                            return Err(CrawlError::Navigation(format!(
                                "failed to return to {original_url}: {e}"
                            )));
                        }
                    }
                }
            }

            let storage_path = self
                .capture_state(page, domain, url, element, "after", form_value.as_deref())
                .await;

            session.records.push(self.record(
                element,
                verb,
                success,
                error,
                redirects,
                popup,
                form_value,
                storage_path,
            ));
            session.note(verb, &element.element_path);

            let pause = rand::thread_rng().gen_range(500..1000);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }

        Ok(BatchEnd::Completed)
    }

    async fn perform(
        &self,
        page: &dyn PageHandle,
        verb: InteractionVerb,
        element: &ElementDescriptor,
    ) -> Result<Option<String>, CrawlError> {
        let path = &element.element_path;
        match verb {
            InteractionVerb::Fill => {
                let value = self.forms.determine_value(element);
                page.fill(path, &value).await?;
                Ok(Some(value))
            }
            InteractionVerb::Check => {
                page.set_checked(path, true).await?;
                Ok(None)
            }
            InteractionVerb::Uncheck => {
                page.set_checked(path, false).await?;
                Ok(None)
            }
            InteractionVerb::SelectOption => page.select_option(path).await,
            // Hover and drag targets respond to a plain click as well; a
            // dedicated pointer protocol is not worth a popup-unsafe path
            InteractionVerb::Click | InteractionVerb::Hover | InteractionVerb::Drag => {
                page.click(path).await?;
                Ok(None)
            }
        }
    }

    /// Race the adapter's new-page watcher against an explicit page-count
    /// comparison; whichever resolves first wins and the loser is dropped.
    /// Any popup found is summarized and force-closed.
    async fn contain_popup(
        &self,
        domain: &str,
        url: &str,
        pages_before: &[String],
    ) -> Option<PopupCapture> {
        let timeout = Duration::from_millis(self.settings.redirect_timeout_ms);

        let comparison = async {
            loop {
                if let Ok(pages) = self.adapter.pages().await {
                    if let Some(new_id) = pages.into_iter().find(|p| !pages_before.contains(p)) {
                        return Some(new_id);
                    }
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        };

        let popup_id = tokio::select! {
            watched = self.adapter.wait_for_new_page(pages_before, timeout) => {
                watched.unwrap_or(None)
            }
            compared = tokio::time::timeout(timeout, comparison) => {
                compared.ok().flatten()
            }
        }?;

        if let Ok(mut slot) = self.popup_slot.lock() {
            *slot = Some(popup_id.clone());
        }

        let capture = self.capture_popup(domain, url, &popup_id).await;
        if let Err(e) = self.adapter.close_page(&popup_id).await {
            warn!(url, popup = %popup_id, error = %e, "failed to close popup");
        }

        if let Ok(mut slot) = self.popup_slot.lock() {
            *slot = None;
        }

        match capture {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!(url, popup = %popup_id, error = %e, "popup capture failed");
                Some(PopupCapture {
                    url: String::new(),
                    element_count: 0,
                    discovered_urls: Vec::new(),
                    screenshot_stored: false,
                })
            }
        }
    }

    /// Popups are evidence only: record what they show, never drive them
    async fn capture_popup(
        &self,
        domain: &str,
        url: &str,
        popup_id: &str,
    ) -> Result<PopupCapture, CrawlError> {
        let popup = self.adapter.attach(popup_id).await?;
        let popup_url = popup.current_url().await.unwrap_or_default();

        let (element_count, discovered_urls) =
            match popup.detect_elements(POPUP_DETECT_TIMEOUT).await {
                Ok(report) => {
                    let urls = extract_urls(&report.interactive_elements, &popup_url);
                    (report.interactive_elements.len(), urls)
                }
                Err(_) => (0, Vec::new()),
            };

        let screenshot = popup.screenshot(self.screenshot_quality).await.ok();
        let screenshot_stored = match self
            .store
            .store_interaction(
                domain,
                url,
                "popup",
                "popup",
                screenshot.as_deref(),
                json!({ "popup_url": popup_url, "element_count": element_count }),
            )
            .await
        {
            Ok(_) => screenshot.is_some(),
            Err(e) => {
                warn!(url, error = %e, "popup artifact not stored");
                false
            }
        };

        Ok(PopupCapture {
            url: popup_url,
            element_count,
            discovered_urls,
            screenshot_stored,
        })
    }

    /// Watch the page URL settle after an interaction, recording each hop up
    /// to the per-interaction ceiling.
    async fn track_redirects(&self, page: &dyn PageHandle, original_url: &str) -> Vec<RedirectEdge> {
        let mut edges = Vec::new();
        let mut last = original_url.to_string();
        let hop_wait = Duration::from_millis(self.settings.redirect_timeout_ms.min(1000));

        for hop in 1..=self.settings.max_redirects_per_interaction {
            tokio::time::sleep(hop_wait).await;
            let current = match page.current_url().await {
                Ok(current) => current,
                Err(_) => break,
            };
            if current == last {
                break;
            }
            debug!(from = %last, to = %current, hop, "interaction redirect");
            edges.push(RedirectEdge {
                from_url: last.clone(),
                to_url: current.clone(),
                redirect_number: hop,
            });
            last = current;
        }

        edges
    }

    /// Best-effort before/after capture; storage problems never stop the batch
    async fn capture_state(
        &self,
        page: &dyn PageHandle,
        domain: &str,
        url: &str,
        element: &ElementDescriptor,
        phase: &str,
        form_value: Option<&str>,
    ) -> Option<String> {
        if phase == "after" {
            if page.is_loading().await.unwrap_or(false) {
                tokio::time::sleep(AFTER_STATE_EXTRA_WAIT).await;
            }
        }

        let screenshot = page.screenshot(self.screenshot_quality).await.ok();

        // A fresh detection pass makes before/after states diffable
        let detected_state = page
            .detect_elements(STATE_DETECT_TIMEOUT)
            .await
            .ok()
            .and_then(|report| serde_json::to_value(report).ok());

        let detail = json!({
            "element_path": element.element_path,
            "tag_name": element.tag_name,
            "verb": element.interaction.action.as_str(),
            "form_value": form_value,
            "detected_state": detected_state,
        });

        match self
            .store
            .store_interaction(
                domain,
                url,
                &element.short_id(),
                phase,
                screenshot.as_deref(),
                detail,
            )
            .await
        {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                warn!(url, element = %element.short_id(), phase, error = %e, "interaction artifact not stored");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        element: &ElementDescriptor,
        verb: InteractionVerb,
        success: bool,
        error: Option<String>,
        redirects: Vec<RedirectEdge>,
        new_tab: Option<PopupCapture>,
        form_value: Option<String>,
        storage_path: Option<String>,
    ) -> InteractionRecord {
        InteractionRecord {
            element_id: element.short_id(),
            element_path: element.element_path.clone(),
            interaction_type: verb.as_str().to_string(),
            timestamp: Utc::now(),
            success,
            error,
            redirects,
            new_tab,
            form_value,
            storage_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(total: usize, click: usize, form: usize) -> InteractionBudget {
        InteractionBudget {
            max_total: total,
            max_click: click,
            max_form: form,
        }
    }

    #[test]
    fn global_budget_trumps_category_budget() {
        let mut session = InteractionSession::new(budget(2, 10, 10));
        session.note(InteractionVerb::Click, "/a[1]");
        session.note(InteractionVerb::Fill, "/input[1]");
        assert_eq!(session.check(InteractionVerb::Click), BudgetCheck::GlobalExhausted);
        assert_eq!(session.check(InteractionVerb::Fill), BudgetCheck::GlobalExhausted);
    }

    #[test]
    fn category_budgets_are_independent() {
        let mut session = InteractionSession::new(budget(20, 1, 1));
        session.note(InteractionVerb::Click, "/a[1]");
        assert_eq!(session.check(InteractionVerb::Click), BudgetCheck::CategoryExhausted);
        // Form budget is untouched by click spending
        assert_eq!(session.check(InteractionVerb::Fill), BudgetCheck::Proceed);
        assert_eq!(session.check(InteractionVerb::Check), BudgetCheck::Proceed);
    }

    #[test]
    fn elements_are_exercised_at_most_once() {
        let mut session = InteractionSession::new(budget(20, 10, 10));
        assert!(!session.already_done("/a[1]"));
        session.note(InteractionVerb::Click, "/a[1]");
        assert!(session.already_done("/a[1]"));
        assert_eq!(session.interactions_count(), 1);
    }
}
