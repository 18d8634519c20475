use thiserror::Error;

/// Where a timeout fired, for error messages and artifact naming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    Detection,
    Scroll,
    Interaction,
    Url,
}

impl TimeoutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutScope::Detection => "element detection",
            TimeoutScope::Scroll => "scroll",
            TimeoutScope::Interaction => "interaction",
            TimeoutScope::Url => "url",
        }
    }
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy for the crawl pipeline.
///
/// Element-level failures are recorded and swallowed, URL-level failures
/// terminate only the URL, domain-level failures release the claim. Only a
/// queue backend that is unreachable at startup is fatal to the process.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("{scope} timed out after {seconds}s")]
    Timeout { scope: TimeoutScope, seconds: u64 },

    #[error("no interactive elements found on the page")]
    NoInteractiveSurface,

    #[error("interaction failed: {0}")]
    Interaction(String),

    #[error("popup handling failed: {0}")]
    PopupHandling(String),

    #[error("artifact storage failed: {0}")]
    Storage(String),

    #[error("queue backend error: {0}")]
    QueueBackend(String),
}

impl CrawlError {
    pub fn url_timeout(seconds: u64) -> Self {
        CrawlError::Timeout {
            scope: TimeoutScope::Url,
            seconds,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CrawlError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_scope() {
        let err = CrawlError::url_timeout(240);
        assert_eq!(err.to_string(), "url timed out after 240s");
        assert!(err.is_timeout());
    }

    #[test]
    fn navigation_error_is_not_timeout() {
        let err = CrawlError::Navigation("net::ERR_NAME_NOT_RESOLVED".into());
        assert!(!err.is_timeout());
        assert!(err.to_string().starts_with("navigation failed"));
    }
}
