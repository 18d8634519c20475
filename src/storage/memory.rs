use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::queue::{
    DomainCompletion, DomainRecord, DomainStatus, NewUrl, StallResets, TaskQueue, UrlCompletion,
    UrlCounts, UrlRecord, UrlStatus,
};

#[derive(Debug, Clone)]
struct StoredUrl {
    record: UrlRecord,
    leased_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    domains: BTreeMap<String, DomainRecord>,
    // Keyed by (domain, url); BTreeMap keeps batch order deterministic
    urls: BTreeMap<(String, String), StoredUrl>,
}

/// In-process task queue with the same semantics as the Mongo backend.
/// Used by tests and single-host runs.
pub struct MemoryQueue {
    state: Mutex<State>,
    max_retries: u32,
}

impl MemoryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_retries,
        }
    }

}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn add_domain(&self, domain: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.domains.contains_key(domain) {
            return Ok(false);
        }
        state.domains.insert(
            domain.to_string(),
            DomainRecord {
                domain: domain.to_string(),
                status: DomainStatus::Pending,
                worker_id: None,
                claimed_at: None,
                heartbeat: None,
            },
        );
        Ok(true)
    }

    async fn claim_domain(&self, worker_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let claimed = state
            .domains
            .values_mut()
            .find(|d| d.status == DomainStatus::Pending);

        if let Some(record) = claimed {
            record.status = DomainStatus::Processing;
            record.worker_id = Some(worker_id.to_string());
            record.claimed_at = Some(Utc::now());
            record.heartbeat = Some(Utc::now());
            debug!(domain = %record.domain, worker = worker_id, "claimed domain");
            Ok(Some(record.domain.clone()))
        } else {
            Ok(None)
        }
    }

    async fn release_domain(&self, domain: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.domains.get_mut(domain) {
            record.status = DomainStatus::Pending;
            record.worker_id = None;
            record.claimed_at = None;
            record.heartbeat = None;
        }
        Ok(())
    }

    async fn mark_domain_completed(&self, domain: &str, _meta: DomainCompletion) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.domains.get_mut(domain) {
            record.status = DomainStatus::Completed;
            record.worker_id = None;
        }
        Ok(())
    }

    async fn pending_batch(
        &self,
        domain: &str,
        limit: usize,
        _worker_id: &str,
    ) -> Result<Vec<UrlRecord>> {
        let mut state = self.state.lock().await;
        let mut batch = Vec::new();

        for ((d, _), stored) in state.urls.iter_mut() {
            if batch.len() >= limit {
                break;
            }
            if d == domain && stored.record.status == UrlStatus::Pending {
                stored.record.status = UrlStatus::Processing;
                stored.leased_at = Some(Utc::now());
                batch.push(stored.record.clone());
            }
        }

        Ok(batch)
    }

    async fn all_urls(&self, domain: &str, page: usize, page_size: usize) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .urls
            .keys()
            .filter(|(d, _)| d == domain)
            .map(|(_, url)| url.clone())
            .skip(page * page_size)
            .take(page_size)
            .collect())
    }

    async fn add_urls(&self, domain: &str, urls: &[NewUrl]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;

        for new_url in urls {
            let key = (domain.to_string(), new_url.url.clone());
            if state.urls.contains_key(&key) {
                continue;
            }
            state.urls.insert(
                key,
                StoredUrl {
                    record: UrlRecord {
                        domain: domain.to_string(),
                        url: new_url.url.clone(),
                        status: UrlStatus::Pending,
                        retries: 0,
                        is_discovered: new_url.is_discovered,
                        last_error: None,
                    },
                    leased_at: None,
                },
            );
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn mark_url_completed(
        &self,
        domain: &str,
        url: &str,
        _meta: UrlCompletion,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.urls.get_mut(&(domain.to_string(), url.to_string())) {
            stored.record.status = UrlStatus::Completed;
            stored.record.last_error = None;
            stored.leased_at = None;
        }
        Ok(())
    }

    async fn mark_url_failed(&self, domain: &str, url: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.urls.get_mut(&(domain.to_string(), url.to_string())) {
            // Terminal only once the retry allowance was already spent, so
            // the URL gets max_retries requeues before it fails for good
            let exhausted = stored.record.retries >= self.max_retries;
            stored.record.retries += 1;
            stored.record.last_error = Some(error.to_string());
            stored.leased_at = None;
            stored.record.status = if exhausted {
                UrlStatus::Failed
            } else {
                UrlStatus::Pending
            };
        }
        Ok(())
    }

    async fn url_counts(&self, domain: &str) -> Result<UrlCounts> {
        let state = self.state.lock().await;
        let mut counts = UrlCounts::default();
        for ((d, _), stored) in state.urls.iter() {
            if d != domain {
                continue;
            }
            match stored.record.status {
                UrlStatus::Pending => counts.pending += 1,
                UrlStatus::Processing => counts.processing += 1,
                UrlStatus::Completed => counts.completed += 1,
                UrlStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let state = self.state.lock().await;
        Ok(state.domains.values().cloned().collect())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        for record in state.domains.values_mut() {
            if record.worker_id.as_deref() == Some(worker_id)
                && record.status == DomainStatus::Processing
            {
                record.heartbeat = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn reset_stalled(&self, cutoff_minutes: i64) -> Result<StallResets> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - Duration::minutes(cutoff_minutes);
        let mut resets = StallResets::default();

        for record in state.domains.values_mut() {
            if record.status == DomainStatus::Processing
                && record.heartbeat.map_or(true, |hb| hb < cutoff)
            {
                record.status = DomainStatus::Pending;
                record.worker_id = None;
                record.claimed_at = None;
                record.heartbeat = None;
                resets.domains += 1;
            }
        }

        for stored in state.urls.values_mut() {
            if stored.record.status == UrlStatus::Processing
                && stored.leased_at.map_or(true, |at| at < cutoff)
            {
                let exhausted = stored.record.retries >= self.max_retries;
                stored.record.retries += 1;
                stored.record.status = if exhausted {
                    UrlStatus::Failed
                } else {
                    UrlStatus::Pending
                };
                stored.leased_at = None;
                resets.urls += 1;
            }
        }

        Ok(resets)
    }

    async fn healthcheck(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive() {
        let queue = MemoryQueue::new(3);
        queue.add_domain("example.com").await.unwrap();

        let first = queue.claim_domain("worker-a").await.unwrap();
        assert_eq!(first.as_deref(), Some("example.com"));

        // Already held, nothing left for a second worker
        let second = queue.claim_domain("worker-b").await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn add_urls_is_idempotent() {
        let queue = MemoryQueue::new(3);
        let urls = vec![NewUrl::seed("http://example.com/a")];

        assert_eq!(queue.add_urls("example.com", &urls).await.unwrap(), 1);
        assert_eq!(queue.add_urls("example.com", &urls).await.unwrap(), 0);
        assert_eq!(queue.url_counts("example.com").await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn failures_return_to_pending_until_the_retry_ceiling() {
        let queue = MemoryQueue::new(3);
        queue
            .add_urls("example.com", &[NewUrl::seed("http://example.com/a")])
            .await
            .unwrap();

        // Three failures spend the retry allowance but the URL stays pending
        for attempt in 1..=3u32 {
            let batch = queue.pending_batch("example.com", 10, "w").await.unwrap();
            assert_eq!(batch.len(), 1, "attempt {attempt} should see the URL");
            queue
                .mark_url_failed("example.com", "http://example.com/a", "boom")
                .await
                .unwrap();
        }
        assert_eq!(queue.url_counts("example.com").await.unwrap().pending, 1);

        // The fourth failure is the terminal one
        let batch = queue.pending_batch("example.com", 10, "w").await.unwrap();
        assert_eq!(batch.len(), 1, "one last attempt after the allowance");
        queue
            .mark_url_failed("example.com", "http://example.com/a", "boom")
            .await
            .unwrap();

        let batch = queue.pending_batch("example.com", 10, "w").await.unwrap();
        assert!(batch.is_empty(), "terminally failed, never leased again");
        assert_eq!(queue.url_counts("example.com").await.unwrap().failed, 1);
    }
}
