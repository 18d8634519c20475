use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use surface_crawler::browser::{BrowserAdapter, LocateOutcome, PageHandle};
use surface_crawler::cli::config::CrawlerConfig;
use surface_crawler::crawler::element::{
    DetectionReport, ElementDescriptor, InteractionVerb, Scrollability, SuggestedInteraction,
};
use surface_crawler::crawler::error::CrawlError;
use surface_crawler::crawler::scheduler::DomainScheduler;
use surface_crawler::forms::FormValueProvider;
use surface_crawler::storage::{ArtifactStore, MemoryQueue, NewUrl, TaskQueue};

fn element(path: &str, verb: InteractionVerb, attrs: &[(&str, &str)]) -> ElementDescriptor {
    ElementDescriptor {
        element_path: path.to_string(),
        tag_name: attrs
            .iter()
            .find(|(k, _)| *k == "tag")
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| "a".to_string()),
        attributes: attrs
            .iter()
            .filter(|(k, _)| *k != "tag")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        interaction: SuggestedInteraction { action: verb },
    }
}

/// Scripted browser: a static site map of url -> detected elements, an
/// action log, concurrency accounting, and an optional scripted popup.
struct MockInner {
    site: HashMap<String, Vec<ElementDescriptor>>,
    actions: Mutex<Vec<String>>,
    open: AtomicUsize,
    max_open: AtomicUsize,
    next_page: AtomicUsize,
    popup: Option<String>,
    popup_served: AtomicBool,
    closed: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct MockBrowser(Arc<MockInner>);

impl MockBrowser {
    fn new(site: HashMap<String, Vec<ElementDescriptor>>) -> Self {
        Self::build(site, None)
    }

    /// A browser where the first click-style interaction opens a popup whose
    /// page hangs once attached
    fn with_popup(site: HashMap<String, Vec<ElementDescriptor>>, popup_id: &str) -> Self {
        Self::build(site, Some(popup_id.to_string()))
    }

    fn build(site: HashMap<String, Vec<ElementDescriptor>>, popup: Option<String>) -> Self {
        Self(Arc::new(MockInner {
            site,
            actions: Mutex::new(Vec::new()),
            open: AtomicUsize::new(0),
            max_open: AtomicUsize::new(0),
            next_page: AtomicUsize::new(0),
            popup,
            popup_served: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
        }))
    }

    fn actions(&self) -> Vec<String> {
        self.0.actions.lock().unwrap().clone()
    }

    fn closed_pages(&self) -> Vec<String> {
        self.0.closed.lock().unwrap().clone()
    }

    fn max_concurrent_pages(&self) -> usize {
        self.0.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserAdapter for MockBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, CrawlError> {
        let open = self.0.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_open.fetch_max(open, Ordering::SeqCst);
        let id = format!("page-{}", self.0.next_page.fetch_add(1, Ordering::SeqCst));
        Ok(Box::new(MockPage {
            id,
            inner: Arc::clone(&self.0),
            current_url: Mutex::new(String::new()),
            hang: false,
        }))
    }

    async fn attach(&self, page_id: &str) -> Result<Box<dyn PageHandle>, CrawlError> {
        if self.0.popup.as_deref() == Some(page_id) {
            return Ok(Box::new(MockPage {
                id: page_id.to_string(),
                inner: Arc::clone(&self.0),
                current_url: Mutex::new(String::new()),
                hang: true,
            }));
        }
        Err(CrawlError::PopupHandling(format!(
            "no such popup: {page_id}"
        )))
    }

    async fn pages(&self) -> Result<Vec<String>, CrawlError> {
        Ok(vec!["main".to_string()])
    }

    async fn wait_for_new_page(
        &self,
        _known: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, CrawlError> {
        if let Some(popup) = &self.0.popup {
            if !self.0.popup_served.swap(true, Ordering::SeqCst) {
                return Ok(Some(popup.clone()));
            }
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn close_page(&self, page_id: &str) -> Result<(), CrawlError> {
        self.0.closed.lock().unwrap().push(page_id.to_string());
        Ok(())
    }
}

struct MockPage {
    id: String,
    inner: Arc<MockInner>,
    current_url: Mutex<String>,
    hang: bool,
}

impl MockPage {
    fn log(&self, action: String) {
        self.inner.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl PageHandle for MockPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        *self.current_url.lock().unwrap() = url.to_string();
        self.log(format!("navigate:{url}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, CrawlError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        Ok(self.current_url.lock().unwrap().clone())
    }

    async fn is_loading(&self) -> Result<bool, CrawlError> {
        Ok(false)
    }

    async fn screenshot(&self, _quality: u8) -> Result<Vec<u8>, CrawlError> {
        Ok(vec![0u8; 8])
    }

    async fn detect_elements(&self, _timeout: Duration) -> Result<DetectionReport, CrawlError> {
        let url = self.current_url.lock().unwrap().clone();
        self.log(format!("detect:{url}"));
        Ok(DetectionReport {
            interactive_elements: self.inner.site.get(&url).cloned().unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn scrollability(&self, _max_viewports: usize) -> Result<Scrollability, CrawlError> {
        Ok(Scrollability::default())
    }

    async fn scroll_to(&self, _offset: i64) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn scroll_into_view(&self, _path: &str) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn locate(&self, _path: &str, _timeout: Duration) -> Result<LocateOutcome, CrawlError> {
        Ok(LocateOutcome::Found)
    }

    async fn fill(&self, path: &str, value: &str) -> Result<(), CrawlError> {
        self.log(format!("fill:{path}={value}"));
        Ok(())
    }

    async fn set_checked(&self, path: &str, checked: bool) -> Result<(), CrawlError> {
        self.log(format!("set_checked:{path}={checked}"));
        Ok(())
    }

    async fn select_option(&self, path: &str) -> Result<Option<String>, CrawlError> {
        self.log(format!("select:{path}"));
        Ok(Some("Option".to_string()))
    }

    async fn click(&self, path: &str) -> Result<(), CrawlError> {
        self.log(format!("click:{path}"));
        Ok(())
    }

    async fn close(&self) -> Result<(), CrawlError> {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config(data_dir: &std::path::Path) -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.crawler.redirect_timeout_ms = 500;
    config
}

fn scheduler(
    queue: Arc<dyn TaskQueue>,
    browser: MockBrowser,
    config: CrawlerConfig,
) -> DomainScheduler {
    let store = Arc::new(ArtifactStore::new(&config.storage));
    let forms = Arc::new(
        FormValueProvider::new(&config.forms).expect("built-in region table must load"),
    );
    DomainScheduler::new(
        queue,
        Arc::new(browser),
        store,
        forms,
        Arc::new(config),
        "worker-test".to_string(),
    )
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("crawl_flow_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test(start_paused = true)]
async fn seed_page_is_explored_and_discoveries_stay_at_depth_one() {
    let mut site = HashMap::new();
    site.insert(
        "http://example.com/".to_string(),
        vec![
            element(
                "/html/body/input[1]",
                InteractionVerb::Fill,
                &[("tag", "input"), ("type", "text"), ("name", "q"), ("placeholder", "Search")],
            ),
            element(
                "/html/body/a[1]",
                InteractionVerb::Click,
                &[("href", "/about")],
            ),
        ],
    );
    // The discovered page links onward; that link must never be enqueued
    site.insert(
        "http://example.com/about".to_string(),
        vec![element(
            "/html/body/a[1]",
            InteractionVerb::Click,
            &[("href", "/contact")],
        )],
    );

    let browser = MockBrowser::new(site);
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let config = test_config(&temp_dir("depth"));
    let sched = scheduler(queue.clone(), browser.clone(), config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert_eq!(stats.processed, 2, "seed and the discovered page");
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.discovered, 1);
    assert!(!stats.time_limit_reached);

    // Depth cap: /contact was seen on the discovered page but never enqueued
    let all = queue.all_urls("example.com", 0, 100).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&"http://example.com/".to_string()));
    assert!(all.contains(&"http://example.com/about".to_string()));

    let counts = queue.url_counts("example.com").await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.pending, 0);

    // Form state is established before anything that can navigate away
    let actions = browser.actions();
    let fill_pos = actions
        .iter()
        .position(|a| a.starts_with("fill:/html/body/input[1]"))
        .expect("the search box was filled");
    let click_pos = actions
        .iter()
        .position(|a| a.starts_with("click:/html/body/a[1]"))
        .expect("the link was clicked");
    assert!(fill_pos < click_pos, "fill must come before click");
}

#[tokio::test(start_paused = true)]
async fn discovery_fanout_is_sampled_down_to_the_cap() {
    let links: Vec<ElementDescriptor> = (0..30)
        .map(|i| {
            element(
                &format!("/html/body/a[{}]", i + 1),
                InteractionVerb::Click,
                &[("href", &*format!("/page{i}"))],
            )
        })
        .collect();

    let mut site = HashMap::new();
    site.insert("http://example.com/".to_string(), links);

    let browser = MockBrowser::new(site);
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let mut config = test_config(&temp_dir("fanout"));
    // Pages beyond the seed are blank in this site map
    config.crawler.no_elements_is_failure = false;
    let sched = scheduler(queue.clone(), browser, config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert_eq!(stats.discovered, 10, "30 candidates sampled down to 10");

    let all = queue.all_urls("example.com", 0, 100).await.unwrap();
    assert_eq!(all.len(), 11, "seed plus ten discoveries");
}

#[tokio::test(start_paused = true)]
async fn concurrent_url_processing_stays_under_the_ceiling() {
    let browser = MockBrowser::new(HashMap::new());
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();

    let seeds: Vec<NewUrl> = (0..12)
        .map(|i| NewUrl::seed(format!("http://example.com/p{i}")))
        .collect();
    queue.add_urls("example.com", &seeds).await.unwrap();

    let mut config = test_config(&temp_dir("concurrency"));
    config.crawler.no_elements_is_failure = false;
    let sched = scheduler(queue.clone(), browser.clone(), config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert_eq!(stats.processed, 12);
    assert!(
        browser.max_concurrent_pages() <= 5,
        "no more than max_concurrent_urls pages at once, saw {}",
        browser.max_concurrent_pages()
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_time_budget_stops_the_domain() {
    let browser = MockBrowser::new(HashMap::new());
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let mut config = test_config(&temp_dir("budget"));
    config.crawler.domain_time_limit_secs = 0;
    let sched = scheduler(queue.clone(), browser, config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert!(stats.time_limit_reached);
    assert_eq!(stats.processed, 0);

    // The URL was never consumed and stays available
    let counts = queue.url_counts("example.com").await.unwrap();
    assert_eq!(counts.pending, 1);
}

#[tokio::test(start_paused = true)]
async fn pages_without_elements_fail_and_burn_retries() {
    // The site map is empty, so every visit finds nothing interactive
    let browser = MockBrowser::new(HashMap::new());
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let config = test_config(&temp_dir("noelements"));
    let sched = scheduler(queue.clone(), browser, config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert_eq!(stats.processed, 0);
    // Three requeues plus the terminal attempt
    assert_eq!(stats.failed, 4, "retry allowance plus one final attempt");

    let counts = queue.url_counts("example.com").await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn state_captures_rerun_element_detection() {
    let mut site = HashMap::new();
    site.insert(
        "http://example.com/".to_string(),
        vec![element(
            "/html/body/input[1]",
            InteractionVerb::Fill,
            &[("tag", "input"), ("type", "text"), ("name", "email")],
        )],
    );

    let browser = MockBrowser::new(site);
    let queue = Arc::new(MemoryQueue::new(3));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let config = test_config(&temp_dir("state_capture"));
    let sched = scheduler(queue.clone(), browser.clone(), config);
    sched.process_domain("example.com").await.unwrap();

    let detects = browser
        .actions()
        .iter()
        .filter(|a| a.as_str() == "detect:http://example.com/")
        .count();
    // One viewport sweep plus a fresh pass for the before and after captures
    assert_eq!(detects, 3);
}

#[tokio::test(start_paused = true)]
async fn timed_out_urls_close_their_popup() {
    let mut site = HashMap::new();
    site.insert(
        "http://example.com/".to_string(),
        vec![element(
            "/html/body/a[1]",
            InteractionVerb::Click,
            &[("href", "/about")],
        )],
    );

    // The click opens a popup whose page hangs once attached, so the URL
    // budget expires while the popup is still being captured
    let browser = MockBrowser::with_popup(site, "popup-7");
    let queue = Arc::new(MemoryQueue::new(0));
    queue.add_domain("example.com").await.unwrap();
    queue
        .add_urls("example.com", &[NewUrl::seed("http://example.com/")])
        .await
        .unwrap();

    let mut config = test_config(&temp_dir("popup_timeout"));
    config.crawler.url_timeout_secs = 30;
    let sched = scheduler(queue.clone(), browser.clone(), config);

    let stats = sched.process_domain("example.com").await.unwrap();
    assert_eq!(stats.failed, 1, "the URL timed out");
    assert!(
        browser.closed_pages().contains(&"popup-7".to_string()),
        "the popup must be closed even though processing was cancelled"
    );
}
