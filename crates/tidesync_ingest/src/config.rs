//! Configuration for the ingestion pipeline.

use crate::parse::{RawItem, ResponseFormat};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::RetryConfig;

/// Predicate deciding whether a parsed item is cached.
pub type ItemFilter = Arc<dyn Fn(&RawItem) -> bool + Send + Sync>;

/// Configuration for one ingestion pipeline.
#[derive(Clone)]
pub struct IngestConfig {
    /// Prefix for every ingested key (`"{namespace}/{key}"`). Empty for none.
    pub namespace: String,
    /// How the response body is laid out.
    pub format: ResponseFormat,
    /// How long ingested records stay valid.
    pub freshness: Duration,
    /// Time between scheduled cycles.
    pub interval: Duration,
    /// Retry configuration for failed fetches.
    pub retry: RetryConfig,
    /// Timeout applied to each fetch.
    pub fetch_timeout: Duration,
    /// Items the filter rejects are counted and dropped before merging.
    pub filter: Option<ItemFilter>,
}

impl IngestConfig {
    /// Creates a configuration for a namespace and response format.
    pub fn new(namespace: impl Into<String>, format: ResponseFormat) -> Self {
        Self {
            namespace: namespace.into(),
            format,
            freshness: Duration::from_secs(60 * 60),
            interval: Duration::from_secs(5 * 60),
            retry: RetryConfig::new(3),
            fetch_timeout: Duration::from_secs(15),
            filter: None,
        }
    }

    /// Sets the freshness window.
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Sets the scheduling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Keeps only the items for which `filter` returns true.
    ///
    /// Used to drop entries that are already stale at the source, such as
    /// fixtures dated in the past.
    pub fn with_filter(
        mut self,
        filter: impl Fn(&RawItem) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Returns true if `item` passes the filter.
    pub fn keeps(&self, item: &RawItem) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(item))
    }

    /// Returns the cache key for an item key.
    pub fn cache_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.namespace, key)
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("namespace", &self.namespace)
            .field("format", &self.format)
            .field("freshness", &self.freshness)
            .field("interval", &self.interval)
            .field("retry", &self.retry)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::new("", ResponseFormat::json())
    }
}
