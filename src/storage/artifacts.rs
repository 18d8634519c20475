use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::cli::config::StorageSettings;

/// Filesystem artifact store.
///
/// Layout: `base/<domain>/<url-path>/<capture_id>/` holding
/// `<capture_id>.png` and `<capture_id>.json`, plus one
/// `session_metadata.json` per URL directory listing every capture.
/// Writes are retried a few times; a persistent failure is reported to the
/// caller but must never abort the crawl.
pub struct ArtifactStore {
    base_dir: PathBuf,
    max_retries: u32,
}

/// Turn an arbitrary string into a safe single path segment
fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        // Keep directory names bounded
        trimmed.chars().take(120).collect()
    }
}

/// Path segment derived from a URL's path and query
fn url_segment(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let mut segment = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                segment.push('_');
                segment.push_str(query);
            }
            sanitize(&segment)
        }
        Err(_) => sanitize(url),
    }
}

impl ArtifactStore {
    pub fn new(config: &StorageSettings) -> Self {
        Self {
            base_dir: config.data_dir.clone(),
            max_retries: config.max_retries.max(1),
        }
    }

    fn url_dir(&self, domain: &str, url: &str) -> PathBuf {
        self.base_dir.join(sanitize(domain)).join(url_segment(url))
    }

    async fn write_with_retries(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match fs::write(path, contents).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(path = %path.display(), attempt, error = %e, "artifact write failed");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64))
                        .await;
                }
            }
        }
        Err(anyhow::Error::new(last_err.context("artifact write exhausted retries")?)
            .context(format!("Failed to write artifact: {}", path.display())))
    }

    /// Persist one capture: optional screenshot plus a metadata document.
    /// Returns the capture directory.
    async fn store_capture(
        &self,
        domain: &str,
        url: &str,
        label: &str,
        screenshot: Option<&[u8]>,
        metadata: Value,
    ) -> Result<PathBuf> {
        let capture_id = format!(
            "{}_{}",
            sanitize(label),
            Uuid::new_v4().simple().to_string()[..8].to_string()
        );
        let capture_dir = self.url_dir(domain, url).join(&capture_id);

        fs::create_dir_all(&capture_dir)
            .await
            .context(format!("Failed to create capture dir: {}", capture_dir.display()))?;

        let mut screenshot_stored = false;
        if let Some(png) = screenshot {
            let png_path = capture_dir.join(format!("{capture_id}.png"));
            self.write_with_retries(&png_path, png).await?;
            screenshot_stored = true;
        }

        let json_path = capture_dir.join(format!("{capture_id}.json"));
        let body = serde_json::to_vec_pretty(&metadata)
            .context("Failed to serialize capture metadata")?;
        self.write_with_retries(&json_path, &body).await?;

        self.append_session_entry(domain, url, &capture_id, label, screenshot_stored)
            .await?;

        debug!(capture = %capture_dir.display(), "stored capture");
        Ok(capture_dir)
    }

    /// Append one capture entry to the per-URL session metadata file
    async fn append_session_entry(
        &self,
        domain: &str,
        url: &str,
        capture_id: &str,
        label: &str,
        screenshot_stored: bool,
    ) -> Result<()> {
        let path = self.url_dir(domain, url).join("session_metadata.json");

        let mut session = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                .unwrap_or_else(|_| json!({ "url": url, "captures": [] })),
            Err(_) => json!({ "url": url, "captures": [] }),
        };

        if let Some(captures) = session
            .get_mut("captures")
            .and_then(|c| c.as_array_mut())
        {
            captures.push(json!({
                "capture_id": capture_id,
                "label": label,
                "screenshot": screenshot_stored,
                "timestamp": Utc::now().to_rfc3339(),
            }));
        }

        let body = serde_json::to_vec_pretty(&session)
            .context("Failed to serialize session metadata")?;
        self.write_with_retries(&path, &body).await
    }

    /// Store a viewport capture (screenshot + detection report)
    pub async fn store_viewport(
        &self,
        domain: &str,
        url: &str,
        viewport_index: usize,
        screenshot: Option<&[u8]>,
        report: Value,
    ) -> Result<PathBuf> {
        let label = format!("viewport_{viewport_index}");
        let metadata = json!({
            "kind": "viewport",
            "url": url,
            "viewport_index": viewport_index,
            "report": report,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.store_capture(domain, url, &label, screenshot, metadata)
            .await
    }

    /// Store a before/after interaction capture
    pub async fn store_interaction(
        &self,
        domain: &str,
        url: &str,
        element_id: &str,
        phase: &str,
        screenshot: Option<&[u8]>,
        detail: Value,
    ) -> Result<PathBuf> {
        let label = format!("{phase}_{element_id}");
        let metadata = json!({
            "kind": "interaction",
            "url": url,
            "element_id": element_id,
            "phase": phase,
            "detail": detail,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.store_capture(domain, url, &label, screenshot, metadata)
            .await
    }

    /// Store error evidence for a URL that could not be processed
    pub async fn store_error(
        &self,
        domain: &str,
        url: &str,
        error: &str,
        screenshot: Option<&[u8]>,
    ) -> Result<PathBuf> {
        let metadata = json!({
            "kind": "error",
            "url": url,
            "error": error,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.store_capture(domain, url, "error", screenshot, metadata)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flattens_unsafe_characters() {
        assert_eq!(sanitize("a/b?c=1"), "a_b_c_1");
        assert_eq!(sanitize("///"), "root");
        assert_eq!(sanitize("shop.example.com"), "shop.example.com");
    }

    #[test]
    fn url_segment_covers_path_and_query() {
        assert_eq!(url_segment("http://x.com/"), "root");
        assert_eq!(url_segment("http://x.com/a/b?q=1"), "a_b_q_1");
    }

    #[tokio::test]
    async fn captures_land_under_domain_and_url_path() {
        let tmp = std::env::temp_dir().join(format!("artifacts_{}", Uuid::new_v4().simple()));
        let store = ArtifactStore {
            base_dir: tmp.clone(),
            max_retries: 2,
        };

        let dir = store
            .store_viewport("example.com", "http://example.com/about", 1, None, json!({}))
            .await
            .unwrap();

        assert!(dir.starts_with(tmp.join("example.com").join("about")));
        assert!(dir
            .parent()
            .unwrap()
            .join("session_metadata.json")
            .exists());

        tokio::fs::remove_dir_all(&tmp).await.ok();
    }
}
