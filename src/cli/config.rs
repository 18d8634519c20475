use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerConfig {
    pub crawler: CrawlSettings,
    pub browser: BrowserSettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    pub forms: FormSettings,
}

/// Crawl budgets and pacing
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlSettings {
    /// Hard cap on URLs processed per claimed domain
    pub max_urls_per_domain: usize,
    /// Pending URLs pulled from the queue at once
    pub url_batch_size: usize,
    /// URLs of one batch processed in parallel
    pub max_concurrent_urls: usize,
    /// Wall-clock budget per claimed domain, seconds
    pub domain_time_limit_secs: u64,
    /// Aggregate timeout over a single URL, seconds
    pub url_timeout_secs: u64,
    pub max_viewports_per_url: usize,
    pub max_interactions_per_url: usize,
    pub max_click_interactions_per_url: usize,
    pub max_form_interactions_per_url: usize,
    pub max_redirects_per_interaction: usize,
    pub redirect_timeout_ms: u64,
    /// Navigate back to the page URL after an interaction moved away from it
    pub return_to_original_url: bool,
    /// Discovered URLs enqueued per source URL
    pub discovery_fanout_cap: usize,
    /// Treat a page with zero interactive elements as a failed URL
    pub no_elements_is_failure: bool,
    /// Attempts before a URL becomes terminally failed
    pub max_retries: u32,
}

/// Browser automation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    /// WebDriver endpoint (chromedriver or a Selenium hub)
    pub webdriver_url: String,
    pub headless: bool,
    /// Optional override for the bundled element-detector script
    pub detector_path: Option<PathBuf>,
    pub viewport: Viewport,
    pub navigation_timeout_ms: u64,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Task queue backend settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    pub mongodb_uri: String,
    pub database: String,
    pub domains_collection: String,
    pub urls_collection: String,
    /// Processing claims older than this are considered stalled
    pub stall_timeout_minutes: i64,
    pub heartbeat_interval_secs: u64,
}

/// Artifact storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// JPEG-style quality hint passed to the screenshot capability
    pub screenshot_quality: u8,
    /// Write attempts before an artifact is dropped
    pub max_retries: u32,
}

/// Form value generation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FormSettings {
    /// Region table the persona is drawn from ("india" or "usa")
    pub region: String,
    /// Named variant within the region table
    pub variety: String,
    /// Optional JSON file with a pre-built persona profile
    pub profiles_file: Option<PathBuf>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlSettings {
                max_urls_per_domain: 100,
                url_batch_size: 10,
                max_concurrent_urls: 5,
                domain_time_limit_secs: 540,
                url_timeout_secs: 240,
                max_viewports_per_url: 9,
                max_interactions_per_url: 20,
                max_click_interactions_per_url: 10,
                max_form_interactions_per_url: 10,
                max_redirects_per_interaction: 3,
                redirect_timeout_ms: 5000,
                return_to_original_url: true,
                discovery_fanout_cap: 10,
                no_elements_is_failure: true,
                max_retries: 3,
            },
            browser: BrowserSettings {
                webdriver_url: "http://localhost:9515".to_string(),
                headless: true,
                detector_path: None,
                viewport: Viewport {
                    width: 1366,
                    height: 768,
                },
                navigation_timeout_ms: 30000,
            },
            queue: QueueSettings {
                mongodb_uri: "mongodb://localhost:27017".to_string(),
                database: "surface_crawler".to_string(),
                domains_collection: "domains".to_string(),
                urls_collection: "url_tasks".to_string(),
                stall_timeout_minutes: 30,
                heartbeat_interval_secs: 30,
            },
            storage: StorageSettings {
                data_dir: PathBuf::from("./crawl_data"),
                screenshot_quality: 80,
                max_retries: 3,
            },
            forms: FormSettings {
                region: "india".to_string(),
                variety: "default".to_string(),
                profiles_file: None,
            },
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "surface-crawler", "surface-crawler")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Load the default configuration, creating it on first run
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents =
            serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_interaction_budgets() {
        let config = CrawlerConfig::default();
        assert_eq!(config.crawler.max_concurrent_urls, 5);
        assert_eq!(config.crawler.url_batch_size, 10);
        assert_eq!(config.crawler.max_viewports_per_url, 9);
        assert_eq!(config.crawler.max_interactions_per_url, 20);
        assert_eq!(config.crawler.max_click_interactions_per_url, 10);
        assert_eq!(config.crawler.max_form_interactions_per_url, 10);
        assert_eq!(config.crawler.discovery_fanout_cap, 10);
        assert!(config.crawler.no_elements_is_failure);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = CrawlerConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: CrawlerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.crawler.domain_time_limit_secs,
            config.crawler.domain_time_limit_secs
        );
        assert_eq!(parsed.queue.mongodb_uri, config.queue.mongodb_uri);
        assert_eq!(parsed.browser.viewport.width, 1366);
    }
}
