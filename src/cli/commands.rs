use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::browser::{BrowserAdapter, WebdriverBrowser};
use crate::cli::config::CrawlerConfig;
use crate::crawler::scheduler::DomainScheduler;
use crate::crawler::urls::{clean_url, sitemap_locations};
use crate::forms::FormValueProvider;
use crate::storage::{ArtifactStore, MemoryQueue, MongoQueue, NewUrl, TaskQueue};

async fn connect_queue(config: &CrawlerConfig) -> Result<Arc<dyn TaskQueue>> {
    let queue = MongoQueue::connect(&config.queue)
        .await?
        .with_max_retries(config.crawler.max_retries);
    Ok(Arc::new(queue))
}

/// Start a crawl worker with one or more concurrent domain tasks
pub async fn run(
    config: CrawlerConfig,
    worker_id: Option<String>,
    concurrent_domains: usize,
    memory_queue: bool,
) -> Result<()> {
    let worker_id = worker_id
        .unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]));
    info!(worker = %worker_id, concurrent_domains, "starting crawl worker");

    let queue: Arc<dyn TaskQueue> = if memory_queue {
        Arc::new(MemoryQueue::new(config.crawler.max_retries))
    } else {
        connect_queue(&config).await?
    };

    // An unreachable backend at startup is the one fatal error
    queue
        .healthcheck()
        .await
        .context("task queue backend is unreachable")?;

    let adapter: Arc<dyn BrowserAdapter> =
        Arc::new(WebdriverBrowser::connect(&config.browser).await?);
    let store = Arc::new(ArtifactStore::new(&config.storage));
    let forms = Arc::new(FormValueProvider::new(&config.forms)?);
    let config = Arc::new(config);

    let mut tasks = Vec::new();
    for task_id in 0..concurrent_domains.max(1) {
        let scheduler = DomainScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&adapter),
            Arc::clone(&store),
            Arc::clone(&forms),
            Arc::clone(&config),
            worker_id.clone(),
        );
        tasks.push(tokio::spawn(async move { scheduler.run(task_id).await }));
    }

    for result in join_all(tasks).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "domain task failed"),
            Err(e) => error!(error = %e, "domain task panicked"),
        }
    }

    Ok(())
}

/// Fetch a domain's sitemap and return the page URLs it lists.
/// Follows one level of sitemap-index nesting.
async fn sitemap_seed_urls(client: &reqwest::Client, domain: &str) -> Result<Vec<String>> {
    for scheme in ["https", "http"] {
        let sitemap_url = format!("{scheme}://{domain}/sitemap.xml");
        let response = match client.get(&sitemap_url).send().await {
            Ok(response) if response.status().is_success() => response,
            _ => continue,
        };
        let body = response
            .text()
            .await
            .context(format!("Failed to read sitemap body from {sitemap_url}"))?;

        let mut urls = Vec::new();
        for location in sitemap_locations(&body) {
            if location.ends_with(".xml") {
                if let Ok(nested) = client.get(&location).send().await {
                    if nested.status().is_success() {
                        if let Ok(nested_body) = nested.text().await {
                            urls.extend(sitemap_locations(&nested_body));
                        }
                    }
                }
            } else {
                urls.push(location);
            }
        }
        return Ok(urls);
    }
    Ok(Vec::new())
}

/// Read a URL file and insert its domains and URLs into the queue
pub async fn load_urls(config: CrawlerConfig, file: PathBuf, use_sitemaps: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(&file)
        .await
        .context(format!("Failed to read URL file: {}", file.display()))?;

    let mut by_domain: HashMap<String, Vec<NewUrl>> = HashMap::new();
    let mut skipped = 0usize;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match clean_url(line).and_then(|cleaned| {
            Url::parse(&cleaned)
                .ok()
                .and_then(|u| u.host_str().map(|h| (h.to_string(), cleaned.clone())))
        }) {
            Some((domain, cleaned)) => {
                by_domain.entry(domain).or_default().push(NewUrl::seed(cleaned));
            }
            None => {
                warn!(url = line, "skipping unusable seed url");
                skipped += 1;
            }
        }
    }

    if use_sitemaps {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client for sitemap fetching")?;

        for (domain, urls) in by_domain.iter_mut() {
            let locations = match sitemap_seed_urls(&client, domain).await {
                Ok(locations) => locations,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "sitemap fetch failed");
                    continue;
                }
            };

            let mut added = 0usize;
            for location in locations {
                if urls.len() >= config.crawler.max_urls_per_domain {
                    break;
                }
                let Some(cleaned) = clean_url(&location) else {
                    continue;
                };
                let same_host = Url::parse(&cleaned)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h == domain))
                    .unwrap_or(false);
                if !same_host || urls.iter().any(|u| u.url == cleaned) {
                    continue;
                }
                urls.push(NewUrl::seed(cleaned));
                added += 1;
            }
            info!(domain = %domain, added, "sitemap seeds added");
        }
    }

    let queue = connect_queue(&config).await?;

    let mut domains_added = 0usize;
    let mut urls_added = 0usize;
    for (domain, urls) in &by_domain {
        if queue.add_domain(domain).await? {
            domains_added += 1;
        }
        urls_added += queue.add_urls(domain, urls).await?;
    }

    println!(
        "Loaded {} new URLs across {} domains ({} new, {} lines skipped)",
        urls_added,
        by_domain.len(),
        domains_added,
        skipped
    );
    Ok(())
}

/// Print per-domain URL counts and overall progress
pub async fn status(config: CrawlerConfig) -> Result<()> {
    let queue = connect_queue(&config).await?;
    let domains = queue.list_domains().await?;

    if domains.is_empty() {
        println!("No domains in the queue.");
        return Ok(());
    }

    println!(
        "{:<40} {:<12} {:>8} {:>10} {:>10} {:>8}",
        "DOMAIN", "STATUS", "PENDING", "PROCESSING", "COMPLETED", "FAILED"
    );

    let mut totals = crate::storage::UrlCounts::default();
    for record in &domains {
        let counts = queue.url_counts(&record.domain).await?;
        println!(
            "{:<40} {:<12} {:>8} {:>10} {:>10} {:>8}",
            record.domain,
            record.status.as_str(),
            counts.pending,
            counts.processing,
            counts.completed,
            counts.failed
        );
        totals.pending += counts.pending;
        totals.processing += counts.processing;
        totals.completed += counts.completed;
        totals.failed += counts.failed;
    }

    println!(
        "\n{} domains, {} URLs total: {} pending, {} processing, {} completed, {} failed",
        domains.len(),
        totals.total(),
        totals.pending,
        totals.processing,
        totals.completed,
        totals.failed
    );
    Ok(())
}

/// Return stalled claims to pending
pub async fn reset_stalled(config: CrawlerConfig, cutoff_minutes: Option<i64>) -> Result<()> {
    let cutoff = cutoff_minutes.unwrap_or(config.queue.stall_timeout_minutes);
    let queue = connect_queue(&config).await?;
    let resets = queue.reset_stalled(cutoff).await?;
    println!(
        "Reset {} stalled domains and {} stalled URL tasks (cutoff {} minutes)",
        resets.domains, resets.urls, cutoff
    );
    Ok(())
}
