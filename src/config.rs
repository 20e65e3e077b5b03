use std::time::Duration;

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_PAGE_SIZE: usize = 500;
/// 50 pages of 500 records: collection stops at 25,000 records.
pub const DEFAULT_MAX_PAGES: usize = 50;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Quiet period after the last filter change before a cycle starts.
    pub debounce: Duration,
    pub page_size: usize,
    pub max_pages: usize,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl PipelineConfig {
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce = Duration::from_millis(debounce_ms);
        self
    }

    pub fn with_page_delay_ms(mut self, page_delay_ms: u64) -> Self {
        self.page_delay = Duration::from_millis(page_delay_ms);
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}
