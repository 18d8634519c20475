use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info};

use crate::cli::config::QueueSettings;

use super::queue::{
    DomainCompletion, DomainRecord, DomainStatus, NewUrl, StallResets, TaskQueue, UrlCompletion,
    UrlCounts, UrlRecord, UrlStatus,
};

/// MongoDB-backed task queue.
///
/// Two collections: a domain registry with a unique index on `domain`, and a
/// URL task list with a unique compound index on `(domain, url)`. All claim
/// and lease operations are single atomic find-and-modify calls.
pub struct MongoQueue {
    domains: Collection<Document>,
    urls: Collection<Document>,
    max_retries: u32,
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

fn bson_cutoff(minutes: i64) -> BsonDateTime {
    let cutoff = chrono::Utc::now() - chrono::Duration::minutes(minutes);
    BsonDateTime::from_millis(cutoff.timestamp_millis())
}

fn to_chrono(dt: &BsonDateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(dt.timestamp_millis())
}

impl MongoQueue {
    /// Connect and ensure the uniqueness indexes exist
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::with_uri_str(&config.mongodb_uri)
            .await
            .context(format!("Failed to connect to MongoDB at {}", config.mongodb_uri))?;

        let db = client.database(&config.database);
        let domains = db.collection::<Document>(&config.domains_collection);
        let urls = db.collection::<Document>(&config.urls_collection);

        domains
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "domain": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await
            .context("Failed to create domain index")?;

        urls.create_index(
            IndexModel::builder()
                .keys(doc! { "domain": 1, "url": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            None,
        )
        .await
        .context("Failed to create url index")?;

        info!(database = %config.database, "connected to MongoDB task queue");

        Ok(Self {
            domains,
            urls,
            max_retries: 3,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn parse_url_record(doc: &Document) -> Result<UrlRecord> {
        Ok(UrlRecord {
            domain: doc.get_str("domain").unwrap_or_default().to_string(),
            url: doc.get_str("url").context("url task missing url field")?.to_string(),
            status: match doc.get_str("status").unwrap_or("pending") {
                "processing" => UrlStatus::Processing,
                "completed" => UrlStatus::Completed,
                "failed" => UrlStatus::Failed,
                _ => UrlStatus::Pending,
            },
            retries: doc.get_i32("retries").unwrap_or(0).max(0) as u32,
            is_discovered: doc.get_bool("is_discovered").unwrap_or(false),
            last_error: doc.get_str("last_error").ok().map(|s| s.to_string()),
        })
    }

    fn parse_domain_record(doc: &Document) -> Result<DomainRecord> {
        Ok(DomainRecord {
            domain: doc
                .get_str("domain")
                .context("domain record missing domain field")?
                .to_string(),
            status: match doc.get_str("status").unwrap_or("pending") {
                "processing" => DomainStatus::Processing,
                "completed" => DomainStatus::Completed,
                _ => DomainStatus::Pending,
            },
            worker_id: doc.get_str("worker_id").ok().map(|s| s.to_string()),
            claimed_at: doc.get_datetime("claimed_at").ok().and_then(to_chrono),
            heartbeat: doc.get_datetime("heartbeat").ok().and_then(to_chrono),
        })
    }
}

#[async_trait]
impl TaskQueue for MongoQueue {
    async fn add_domain(&self, domain: &str) -> Result<bool> {
        let record = doc! {
            "domain": domain,
            "status": "pending",
            "added_at": BsonDateTime::now(),
        };
        match self.domains.insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to insert domain"),
        }
    }

    async fn claim_domain(&self, worker_id: &str) -> Result<Option<String>> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let claimed = self
            .domains
            .find_one_and_update(
                doc! { "status": "pending" },
                doc! { "$set": {
                    "status": "processing",
                    "worker_id": worker_id,
                    "claimed_at": BsonDateTime::now(),
                    "heartbeat": BsonDateTime::now(),
                }},
                options,
            )
            .await
            .context("Failed to claim domain")?;

        match claimed {
            Some(doc) => {
                let domain = doc
                    .get_str("domain")
                    .context("claimed domain record missing domain field")?
                    .to_string();
                debug!(domain = %domain, worker = worker_id, "claimed domain");
                Ok(Some(domain))
            }
            None => Ok(None),
        }
    }

    async fn release_domain(&self, domain: &str) -> Result<()> {
        self.domains
            .update_one(
                doc! { "domain": domain },
                doc! {
                    "$set": { "status": "pending" },
                    "$unset": { "worker_id": "", "claimed_at": "", "heartbeat": "" },
                },
                None,
            )
            .await
            .context("Failed to release domain")?;
        Ok(())
    }

    async fn mark_domain_completed(&self, domain: &str, meta: DomainCompletion) -> Result<()> {
        self.domains
            .update_one(
                doc! { "domain": domain },
                doc! {
                    "$set": {
                        "status": "completed",
                        "completed_at": BsonDateTime::now(),
                        "processed": meta.processed as i64,
                        "failed": meta.failed as i64,
                        "discovered": meta.discovered as i64,
                        "elapsed_secs": meta.elapsed_secs as i64,
                        "time_limit_reached": meta.time_limit_reached,
                    },
                    "$unset": { "worker_id": "" },
                },
                None,
            )
            .await
            .context("Failed to mark domain completed")?;
        Ok(())
    }

    async fn pending_batch(
        &self,
        domain: &str,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<UrlRecord>> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let mut batch = Vec::with_capacity(limit);

        // One atomic lease per document; losers of a race simply see fewer
        for _ in 0..limit {
            let leased = self
                .urls
                .find_one_and_update(
                    doc! { "domain": domain, "status": "pending" },
                    doc! { "$set": {
                        "status": "processing",
                        "worker_id": worker_id,
                        "leased_at": BsonDateTime::now(),
                    }},
                    options.clone(),
                )
                .await
                .context("Failed to lease url task")?;

            match leased {
                Some(doc) => batch.push(Self::parse_url_record(&doc)?),
                None => break,
            }
        }

        Ok(batch)
    }

    async fn all_urls(&self, domain: &str, page: usize, page_size: usize) -> Result<Vec<String>> {
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .skip((page * page_size) as u64)
            .limit(page_size as i64)
            .projection(doc! { "url": 1 })
            .build();

        let mut cursor = self
            .urls
            .find(doc! { "domain": domain }, options)
            .await
            .context("Failed to page url tasks")?;

        let mut urls = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            if let Ok(url) = doc.get_str("url") {
                urls.push(url.to_string());
            }
        }
        Ok(urls)
    }

    async fn add_urls(&self, domain: &str, urls: &[NewUrl]) -> Result<usize> {
        let mut inserted = 0;
        for new_url in urls {
            let record = doc! {
                "domain": domain,
                "url": &new_url.url,
                "status": "pending",
                "retries": 0i32,
                "is_discovered": new_url.is_discovered,
                "added_at": BsonDateTime::now(),
            };
            match self.urls.insert_one(record, None).await {
                Ok(_) => inserted += 1,
                Err(e) if is_duplicate_key(&e) => {}
                Err(e) => return Err(e).context("Failed to insert url task"),
            }
        }
        debug!(domain = %domain, inserted, total = urls.len(), "added url tasks");
        Ok(inserted)
    }

    async fn mark_url_completed(&self, domain: &str, url: &str, meta: UrlCompletion) -> Result<()> {
        self.urls
            .update_one(
                doc! { "domain": domain, "url": url },
                doc! {
                    "$set": {
                        "status": "completed",
                        "completed_at": BsonDateTime::now(),
                        "elements_count": meta.elements_count as i64,
                        "discovered_count": meta.discovered_count as i64,
                        "interactions_count": meta.interactions_count as i64,
                        "viewport_count": meta.viewport_count as i64,
                    },
                    "$unset": { "leased_at": "", "last_error": "" },
                },
                None,
            )
            .await
            .context("Failed to mark url completed")?;
        Ok(())
    }

    async fn mark_url_failed(&self, domain: &str, url: &str, error: &str) -> Result<()> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .urls
            .find_one_and_update(
                doc! { "domain": domain, "url": url },
                doc! {
                    "$inc": { "retries": 1i32 },
                    "$set": { "status": "pending", "last_error": error },
                    "$unset": { "leased_at": "" },
                },
                options,
            )
            .await
            .context("Failed to record url failure")?;

        if let Some(doc) = updated {
            // `retries` is post-increment here; the URL gets max_retries
            // requeues, so only the (max_retries + 1)th failure is terminal
            let retries = doc.get_i32("retries").unwrap_or(0);
            if retries > self.max_retries as i32 {
                self.urls
                    .update_one(
                        doc! { "domain": domain, "url": url },
                        doc! { "$set": { "status": "failed" } },
                        None,
                    )
                    .await
                    .context("Failed to mark url terminally failed")?;
            }
        }

        Ok(())
    }

    async fn url_counts(&self, domain: &str) -> Result<UrlCounts> {
        let pipeline = vec![
            doc! { "$match": { "domain": domain } },
            doc! { "$group": { "_id": "$status", "count": { "$sum": 1i32 } } },
        ];

        let mut cursor = self
            .urls
            .aggregate(pipeline, None)
            .await
            .context("Failed to aggregate url counts")?;

        let mut counts = UrlCounts::default();
        while let Some(doc) = cursor.try_next().await? {
            let count = doc.get_i32("count").unwrap_or(0).max(0) as u64;
            match doc.get_str("_id").unwrap_or("") {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let mut cursor = self
            .domains
            .find(doc! {}, None)
            .await
            .context("Failed to list domains")?;

        let mut records = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            records.push(Self::parse_domain_record(&doc)?);
        }
        Ok(records)
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.domains
            .update_many(
                doc! { "worker_id": worker_id, "status": "processing" },
                doc! { "$set": { "heartbeat": BsonDateTime::now() } },
                None,
            )
            .await
            .context("Failed to update worker heartbeat")?;
        Ok(())
    }

    async fn reset_stalled(&self, cutoff_minutes: i64) -> Result<StallResets> {
        let cutoff = bson_cutoff(cutoff_minutes);

        let domains = self
            .domains
            .update_many(
                doc! {
                    "status": "processing",
                    "$or": [
                        { "heartbeat": { "$lt": cutoff } },
                        { "heartbeat": { "$exists": false } },
                    ],
                },
                doc! {
                    "$set": { "status": "pending" },
                    "$unset": { "worker_id": "", "claimed_at": "", "heartbeat": "" },
                },
                None,
            )
            .await
            .context("Failed to reset stalled domains")?;

        let urls = self
            .urls
            .update_many(
                doc! { "status": "processing", "leased_at": { "$lt": cutoff } },
                doc! {
                    "$set": { "status": "pending" },
                    "$inc": { "retries": 1i32 },
                    "$unset": { "leased_at": "" },
                },
                None,
            )
            .await
            .context("Failed to reset stalled url tasks")?;

        // Terminally fail anything that burned through its retries while stalled
        self.urls
            .update_many(
                doc! { "status": "pending", "retries": { "$gt": self.max_retries as i32 } },
                doc! { "$set": { "status": "failed" } },
                None,
            )
            .await
            .context("Failed to finalize exhausted url tasks")?;

        Ok(StallResets {
            domains: domains.modified_count,
            urls: urls.modified_count,
        })
    }

    async fn healthcheck(&self) -> Result<()> {
        // Cheap round-trip; any response means the backend is reachable
        self.domains
            .estimated_document_count(None)
            .await
            .context("MongoDB healthcheck failed")?;
        Ok(())
    }
}
