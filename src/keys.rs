//! Cache eligibility and key derivation.
//!
//! Pure functions over the request method, path, and configuration; the
//! middleware calls these before touching the store.

use axum::http::Method;
use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, KeyStyle};

/// User id recorded in user-specific keys when no identity is present.
pub const ANONYMOUS_USER_ID: i64 = -1;

// Hashed page segments keep the first 16 digest bytes (32 hex chars).
const HASHED_SEGMENT_BYTES: usize = 16;

/// Strip leading and trailing slashes from a request path.
///
/// `/example/` and `example` refer to the same page; the root path becomes
/// the empty segment.
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Whether a request may be answered from or stored into the page cache.
///
/// Only GET requests are eligible, the cache must be enabled, and the
/// normalized path must not appear in the ignored list. Ignored entries are
/// compared after the same slash trimming, so `dashboard`, `/dashboard`, and
/// `dashboard/` all name the same page and an entry of `/` matches only the
/// root path.
pub fn is_eligible(config: &CacheConfig, method: &Method, path: &str) -> bool {
    if !config.enabled {
        return false;
    }

    if method != Method::GET {
        return false;
    }

    let page = normalize_path(path);
    !config
        .ignored
        .iter()
        .any(|entry| normalize_path(entry) == page)
}

/// Derive the cache key for a page.
///
/// The key is `{prefix}{page segment}_{locale}`, with `_{user id}` (or
/// [`ANONYMOUS_USER_ID`]) appended when `user_specific` is set. Identical
/// inputs always derive identical keys; the query string never participates.
pub fn cache_key(config: &CacheConfig, path: &str, locale: &str, user: Option<i64>) -> String {
    let page = normalize_path(path);
    let segment = match config.key_style {
        KeyStyle::Literal => page.replace('/', "_"),
        KeyStyle::Hashed => hash_page(page),
    };

    let mut key = format!("{}{}_{}", config.prefix, segment, locale);
    if config.user_specific {
        key.push('_');
        key.push_str(&user.unwrap_or(ANONYMOUS_USER_ID).to_string());
    }
    key
}

fn hash_page(page: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(page.as_bytes());
    hex::encode(&hasher.finalize()[..HASHED_SEGMENT_BYTES])
}
