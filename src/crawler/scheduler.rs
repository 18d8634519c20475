use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::BrowserAdapter;
use crate::cli::config::CrawlerConfig;
use crate::forms::FormValueProvider;
use crate::storage::{ArtifactStore, DomainCompletion, NewUrl, TaskQueue, UrlCompletion};

use super::processor::UrlProcessor;
use super::urls::clean_url;

const KNOWN_URL_PAGE_SIZE: usize = 100;
const IDLE_POLL: Duration = Duration::from_secs(10);

/// What one claimed domain yielded
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub processed: usize,
    pub failed: usize,
    pub discovered: usize,
    pub elapsed_secs: u64,
    pub urls_per_second: f64,
    pub time_limit_reached: bool,
    pub known_urls: usize,
}

/// Normalize, deduplicate and sample discovered URLs against the known set.
///
/// Every URL that survives cleaning enters `known` so later pages on the same
/// domain cannot re-discover it; the returned sample is a random subset
/// capped at `fanout`.
pub fn select_discoveries(
    candidates: &[String],
    known: &mut HashSet<String>,
    fanout: usize,
) -> Vec<String> {
    let mut fresh = Vec::new();
    for raw in candidates {
        if let Some(cleaned) = clean_url(raw) {
            if known.insert(cleaned.clone()) {
                fresh.push(cleaned);
            }
        }
    }
    fresh.shuffle(&mut rand::thread_rng());
    fresh.truncate(fanout);
    fresh
}

/// Aborts the wrapped task on drop, so every exit from `process_domain`
/// stops the heartbeat loop, early `?` returns included.
struct TaskGuard(tokio::task::JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Claims domains one at a time and drives them to completion under the
/// domain time budget. All queue bookkeeping happens here; the processor
/// only reports outcomes.
pub struct DomainScheduler {
    queue: Arc<dyn TaskQueue>,
    adapter: Arc<dyn BrowserAdapter>,
    store: Arc<ArtifactStore>,
    forms: Arc<FormValueProvider>,
    config: Arc<CrawlerConfig>,
    worker_id: String,
}

impl DomainScheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        adapter: Arc<dyn BrowserAdapter>,
        store: Arc<ArtifactStore>,
        forms: Arc<FormValueProvider>,
        config: Arc<CrawlerConfig>,
        worker_id: String,
    ) -> Self {
        Self {
            queue,
            adapter,
            store,
            forms,
            config,
            worker_id,
        }
    }

    /// Worker loop: claim, process, complete or release, repeat.
    /// Runs until the task is cancelled.
    pub async fn run(&self, task_id: usize) -> Result<()> {
        info!(task = task_id, worker = %self.worker_id, "domain task started");

        loop {
            let claimed = self
                .queue
                .claim_domain(&self.worker_id)
                .await
                .context("domain claim failed")?;

            let Some(domain) = claimed else {
                debug!(task = task_id, "no pending domains, waiting");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            };

            match self.process_domain(&domain).await {
                Ok(stats) => {
                    info!(
                        domain = %domain,
                        processed = stats.processed,
                        failed = stats.failed,
                        discovered = stats.discovered,
                        elapsed = stats.elapsed_secs,
                        time_limit = stats.time_limit_reached,
                        "domain completed"
                    );
                    self.queue
                        .mark_domain_completed(
                            &domain,
                            DomainCompletion {
                                processed: stats.processed,
                                failed: stats.failed,
                                discovered: stats.discovered,
                                elapsed_secs: stats.elapsed_secs,
                                time_limit_reached: stats.time_limit_reached,
                            },
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "domain processing failed, releasing claim");
                    self.queue.release_domain(&domain).await?;
                }
            }

            let pause = rand::thread_rng().gen_range(1000..3000);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    /// Process one claimed domain: batch, chunk, gather, bookkeep.
    pub async fn process_domain(&self, domain: &str) -> Result<DomainStats> {
        let settings = &self.config.crawler;
        let started = Instant::now();
        let time_limit = Duration::from_secs(settings.domain_time_limit_secs);

        let mut known = self.load_known_urls(domain).await?;
        let _heartbeat = TaskGuard(self.spawn_heartbeat());

        let processor = UrlProcessor {
            adapter: self.adapter.as_ref(),
            store: self.store.as_ref(),
            forms: self.forms.as_ref(),
            config: self.config.as_ref(),
        };

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut discovered = 0usize;
        let mut attempted = 0usize;
        let mut time_limit_reached = false;

        'domain: while attempted < settings.max_urls_per_domain {
            if started.elapsed() >= time_limit {
                time_limit_reached = true;
                break;
            }

            let quota_left = settings.max_urls_per_domain - attempted;
            let batch = self
                .queue
                .pending_batch(
                    domain,
                    settings.url_batch_size.min(quota_left),
                    &self.worker_id,
                )
                .await?;
            if batch.is_empty() {
                break;
            }

            for chunk in batch.chunks(settings.max_concurrent_urls.max(1)) {
                if started.elapsed() >= time_limit {
                    time_limit_reached = true;
                    // Unprocessed leases go back on the next stalled sweep
                    break 'domain;
                }

                let outcomes = join_all(
                    chunk
                        .iter()
                        .map(|task| processor.process(&task.url, domain, task.is_discovered)),
                )
                .await;

                for outcome in outcomes {
                    attempted += 1;

                    if outcome.success {
                        processed += 1;

                        // Depth cap: discovered URLs never expand further
                        if !outcome.is_discovered && !outcome.discovered_urls.is_empty() {
                            let sample = select_discoveries(
                                &outcome.discovered_urls,
                                &mut known,
                                settings.discovery_fanout_cap,
                            );
                            if !sample.is_empty() {
                                let new_urls: Vec<NewUrl> = sample
                                    .iter()
                                    .map(|u| NewUrl::discovered(u.clone()))
                                    .collect();
                                discovered +=
                                    self.queue.add_urls(domain, &new_urls).await?;
                            }
                        }

                        self.queue
                            .mark_url_completed(
                                domain,
                                &outcome.url,
                                UrlCompletion {
                                    elements_count: outcome.elements.len(),
                                    discovered_count: outcome.discovered_urls.len(),
                                    interactions_count: outcome.interactions_count,
                                    viewport_count: outcome.viewport_count,
                                },
                            )
                            .await?;
                    } else {
                        failed += 1;
                        let reason = outcome
                            .error
                            .as_deref()
                            .unwrap_or("unknown error");
                        self.queue
                            .mark_url_failed(domain, &outcome.url, reason)
                            .await?;
                    }
                }

                let pause = rand::thread_rng().gen_range(1000..3000);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }

        let elapsed_secs = started.elapsed().as_secs();
        Ok(DomainStats {
            domain: domain.to_string(),
            processed,
            failed,
            discovered,
            elapsed_secs,
            urls_per_second: if elapsed_secs > 0 {
                attempted as f64 / elapsed_secs as f64
            } else {
                attempted as f64
            },
            time_limit_reached,
            known_urls: known.len(),
        })
    }

    /// Snapshot every URL the queue already knows for this domain
    async fn load_known_urls(&self, domain: &str) -> Result<HashSet<String>> {
        let mut known = HashSet::new();
        let mut page = 0;
        loop {
            let urls = self
                .queue
                .all_urls(domain, page, KNOWN_URL_PAGE_SIZE)
                .await?;
            if urls.is_empty() {
                break;
            }
            known.extend(urls);
            page += 1;
        }
        debug!(domain, known = known.len(), "known url set loaded");
        Ok(known)
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let worker_id = self.worker_id.clone();
        let interval = Duration::from_secs(self.config.queue.heartbeat_interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = queue.heartbeat(&worker_id).await {
                    warn!(worker = %worker_id, error = %e, "heartbeat failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn dropping_the_guard_stops_the_heartbeat_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let guard = TaskGuard(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let before = ticks.load(Ordering::SeqCst);
        assert!(before >= 2, "the task was ticking while guarded");

        drop(guard);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), before, "no ticks after drop");
    }

    #[test]
    fn discoveries_are_cleaned_deduped_and_capped() {
        let mut known = HashSet::new();
        known.insert("http://example.com/old".to_string());

        let candidates: Vec<String> = (0..30)
            .map(|i| format!("http://example.com/page{i}#section"))
            .chain(["http://example.com/old".to_string()])
            .chain(["javascript:void(0)".to_string()])
            .collect();

        let sample = select_discoveries(&candidates, &mut known, 10);
        assert_eq!(sample.len(), 10);
        assert!(sample.iter().all(|u| !u.contains('#')));
        assert!(!sample.contains(&"http://example.com/old".to_string()));

        // Every cleaned candidate is now known, sampled or not
        assert_eq!(known.len(), 31);

        // A second pass over the same candidates finds nothing new
        let again = select_discoveries(&candidates, &mut known, 10);
        assert!(again.is_empty());
    }
}
