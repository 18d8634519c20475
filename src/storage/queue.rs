use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a domain claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Processing,
    Completed,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Pending => "pending",
            DomainStatus::Processing => "processing",
            DomainStatus::Completed => "completed",
        }
    }
}

/// Lifecycle of a URL task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Completed => "completed",
            UrlStatus::Failed => "failed",
        }
    }
}

/// One domain in the work registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub status: DomainStatus,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// One URL task within a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub domain: String,
    pub url: String,
    pub status: UrlStatus,
    pub retries: u32,
    /// True when the URL came out of interaction exploration rather than the
    /// seed file; such URLs never contribute further discoveries
    pub is_discovered: bool,
    pub last_error: Option<String>,
}

/// URL to insert into a domain's task list
#[derive(Debug, Clone)]
pub struct NewUrl {
    pub url: String,
    pub is_discovered: bool,
}

impl NewUrl {
    pub fn seed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_discovered: false,
        }
    }

    pub fn discovered(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_discovered: true,
        }
    }
}

/// Completion metadata recorded alongside a finished URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlCompletion {
    pub elements_count: usize,
    pub discovered_count: usize,
    pub interactions_count: usize,
    pub viewport_count: usize,
}

/// Completion metadata recorded alongside a finished domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainCompletion {
    pub processed: usize,
    pub failed: usize,
    pub discovered: usize,
    pub elapsed_secs: u64,
    pub time_limit_reached: bool,
}

/// Per-status URL counts for one domain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UrlCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl UrlCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Counters returned by a stalled-work sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct StallResets {
    pub domains: u64,
    pub urls: u64,
}

/// Task queue backend for distributing domains and URL tasks.
///
/// Implementations must make `claim_domain` atomic (at most one worker ever
/// holds a domain in Processing) and `add_urls` idempotent per (domain, url).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Register a domain as pending. Returns `false` when it already existed.
    async fn add_domain(&self, domain: &str) -> Result<bool>;

    /// Atomically claim one pending domain for this worker. Returns `None`
    /// when no pending domain exists.
    async fn claim_domain(&self, worker_id: &str) -> Result<Option<String>>;

    /// Return a claimed domain to pending without completing it
    async fn release_domain(&self, domain: &str) -> Result<()>;

    /// Mark a claimed domain completed, with crawl metadata
    async fn mark_domain_completed(&self, domain: &str, meta: DomainCompletion) -> Result<()>;

    /// Lease up to `limit` pending URLs of a domain, moving them to
    /// Processing under this worker
    async fn pending_batch(&self, domain: &str, limit: usize, worker_id: &str)
        -> Result<Vec<UrlRecord>>;

    /// One page of every URL known for a domain, regardless of status.
    /// An empty page means the snapshot is exhausted.
    async fn all_urls(&self, domain: &str, page: usize, page_size: usize) -> Result<Vec<String>>;

    /// Insert URL tasks; existing (domain, url) pairs are silently kept.
    /// Returns how many were actually inserted.
    async fn add_urls(&self, domain: &str, urls: &[NewUrl]) -> Result<usize>;

    async fn mark_url_completed(&self, domain: &str, url: &str, meta: UrlCompletion) -> Result<()>;

    /// Record a failed attempt: the URL goes back to Pending with `retries`
    /// incremented until the retry allowance is spent, so it gets
    /// `max_retries + 1` attempts before the last failure makes it Failed.
    async fn mark_url_failed(&self, domain: &str, url: &str, error: &str) -> Result<()>;

    async fn url_counts(&self, domain: &str) -> Result<UrlCounts>;

    /// Every domain in the registry, for status reporting
    async fn list_domains(&self) -> Result<Vec<DomainRecord>>;

    /// Refresh this worker's liveness marker on its claimed domains
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Reset Processing domains with stale heartbeats and Processing URLs
    /// older than the cutoff back to Pending
    async fn reset_stalled(&self, cutoff_minutes: i64) -> Result<StallResets>;

    /// Cheap connectivity probe; failure at startup is fatal
    async fn healthcheck(&self) -> Result<()>;
}
