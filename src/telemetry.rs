//! Metric names and descriptions for the page cache.
//!
//! The crate only emits through the `metrics` facade; the host application
//! installs the recorder (and its tracing subscriber).

use std::sync::Once;

use metrics::{Unit, describe_counter};

pub const METRIC_CACHE_HIT: &str = "strato_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "strato_cache_miss_total";
pub const METRIC_CACHE_BYPASS: &str = "strato_cache_bypass_total";
pub const METRIC_CACHE_STORE: &str = "strato_cache_store_total";
pub const METRIC_CACHE_EVICT: &str = "strato_cache_evict_total";
pub const METRIC_CACHE_STORE_ERROR: &str = "strato_cache_store_error_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register units and descriptions with the installed metrics recorder.
///
/// Safe to call more than once; descriptions are registered a single time.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of requests served from the page cache."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of eligible requests that executed the handler."
        );
        describe_counter!(
            METRIC_CACHE_BYPASS,
            Unit::Count,
            "Total number of requests not eligible for the page cache."
        );
        describe_counter!(
            METRIC_CACHE_STORE,
            Unit::Count,
            "Total number of pages written to the cache store."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Total number of pages evicted from the in-memory store at capacity."
        );
        describe_counter!(
            METRIC_CACHE_STORE_ERROR,
            Unit::Count,
            "Total number of failed cache store reads and writes."
        );
    });
}
