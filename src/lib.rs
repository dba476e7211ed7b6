//! Strato
//!
//! Locale-aware response caching middleware for axum applications.
//!
//! The first eligible GET request for a page executes the handler and stores
//! the successful response; later requests with the same path, locale, and
//! (optionally) user identity are answered straight from the cache without
//! running the handler at all. Storage is behind the [`CacheStore`] trait;
//! [`MemoryStore`] ships in the crate, any backend that implements the trait
//! can replace it.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `strato.toml` or `STRATO_*` environment
//! variables:
//!
//! ```toml
//! enabled = true
//! prefix = "html_"
//! minutes = 360
//! user_specific = false
//! ignored = ["dashboard"]
//! # ... see CacheConfig for the full list
//! ```
//!
//! ## Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::{Router, middleware, routing::get};
//! use strato::{CacheConfig, CacheState, MemoryStore, page_cache_layer};
//!
//! let config = CacheConfig::default();
//! let store = Arc::new(MemoryStore::new(&config));
//! let state = CacheState::new(config, store);
//!
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(middleware::from_fn_with_state(state, page_cache_layer));
//! ```

mod config;
mod keys;
mod lock;
mod middleware;
mod resolve;
mod store;
pub mod telemetry;

pub use config::{CacheConfig, KeyStyle, LoadError};
pub use keys::{ANONYMOUS_USER_ID, cache_key, is_eligible, normalize_path};
pub use middleware::{CacheState, page_cache_layer};
pub use resolve::{
    AcceptLanguageLocale, Anonymous, ExtensionIdentity, FixedLocale, IdentityResolver,
    LocaleResolver, UserId,
};
pub use store::{CacheStore, CachedPage, Computed, Fetched, MemoryStore, PageSupplier, StoreError};
