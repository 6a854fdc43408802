//! Tunables for the catalog engine.

use std::time::Duration;

/// Default debounce window for raw change signals.
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// Default delay between the last deactivation and table teardown.
pub const DEFAULT_TEARDOWN_GRACE_MS: u64 = 3000;

/// Default bound for callers waiting synchronously on the worker.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 500;

/// Default window in which a recently used table keeps its identities at teardown.
pub const DEFAULT_RETAIN_IDS_SECS: u64 = 60;

/// Configuration for a [`MediaCatalog`](crate::MediaCatalog).
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Raw change signals arriving within this window collapse into one notification.
    pub settle_interval: Duration,
    /// How long teardown waits after the last activation handle is closed.
    pub teardown_grace: Duration,
    /// Upper bound for synchronous lookups such as `obtain_record`.
    pub request_timeout: Duration,
    /// Tables active within this window degrade to placeholders instead of clearing.
    pub retain_ids_window: Duration,
    /// Optional periodic resync while active (for sources without native signals).
    pub poll_interval: Option<Duration>,
    /// Re-query materialized records after every change notification.
    pub refresh_loaded_on_change: bool,
    /// Thread name for the content worker.
    pub worker_name: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            settle_interval: Duration::from_millis(DEFAULT_SETTLE_MS),
            teardown_grace: Duration::from_millis(DEFAULT_TEARDOWN_GRACE_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retain_ids_window: Duration::from_secs(DEFAULT_RETAIN_IDS_SECS),
            poll_interval: None,
            refresh_loaded_on_change: true,
            worker_name: "catalog-content".to_string(),
        }
    }
}
