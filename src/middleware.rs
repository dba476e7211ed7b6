//! Page cache middleware.
//!
//! Serves eligible GET requests from the cache store and captures handler
//! responses for later requests. Skips everything the eligibility rules or
//! the storage guards reject.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::config::CacheConfig;
use crate::keys::{cache_key, is_eligible};
use crate::resolve::{AcceptLanguageLocale, Anonymous, IdentityResolver, LocaleResolver};
use crate::store::{CacheStore, CachedPage, Computed, Fetched};
use crate::telemetry::{METRIC_CACHE_BYPASS, METRIC_CACHE_HIT, METRIC_CACHE_MISS};

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub store: Arc<dyn CacheStore>,
    pub locale: Arc<dyn LocaleResolver>,
    pub identity: Arc<dyn IdentityResolver>,
}

impl CacheState {
    /// State with the default resolvers: `Accept-Language` locale, anonymous
    /// identity.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            config,
            store,
            locale: Arc::new(AcceptLanguageLocale::default()),
            identity: Arc::new(Anonymous),
        }
    }

    pub fn with_locale_resolver(mut self, locale: Arc<dyn LocaleResolver>) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_identity_resolver(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }
}

/// Middleware for page caching.
///
/// Only GET requests outside the ignored list are cached, and only exact
/// 200 responses without cookies or streaming bodies are ever stored. The
/// supplier hands storage decisions to the store in a single
/// `compute_if_absent` interaction, so stores with single-flight semantics
/// run the handler at most once per key.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_eligible(&cache.config, request.method(), request.uri().path()) {
        debug!(outcome = "bypass", "request not eligible for page cache");
        counter!(METRIC_CACHE_BYPASS).increment(1);
        return next.run(request).await;
    }

    let locale = cache.locale.resolve(&request);
    let user = cache.identity.resolve(&request);
    let key = cache_key(&cache.config, request.uri().path(), &locale, user);
    let ttl = cache.config.ttl();
    let max_body_bytes = cache.config.max_body_bytes;

    let supplier = Box::pin(async move {
        let response = next.run(request).await;
        snapshot_response(response, max_body_bytes).await
    });

    match cache.store.compute_if_absent(&key, ttl, supplier).await {
        Fetched::Hit(page) => {
            debug!(outcome = "hit", "serving cached page");
            counter!(METRIC_CACHE_HIT).increment(1);
            build_response(page)
        }
        Fetched::Fresh(response) => {
            debug!(outcome = "miss", "handler executed");
            counter!(METRIC_CACHE_MISS).increment(1);
            response
        }
    }
}

/// Decide storability and snapshot the body when the response qualifies.
async fn snapshot_response(response: Response, max_body_bytes: usize) -> Computed {
    if !should_store_response(&response, max_body_bytes) {
        return Computed::Uncacheable(response);
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(error) => {
            // The body is consumed at this point, nothing left to serve
            warn!(error = %error, "failed to buffer response body");
            return Computed::Uncacheable(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    };

    let page = CachedPage::new(parts.status, &parts.headers, bytes.clone());
    Computed::Cacheable {
        page,
        response: Response::from_parts(parts, Body::from(bytes)),
    }
}

/// Whether a handler response may be stored.
///
/// Requires exactly 200 OK so redirects and error pages never shadow the
/// page that produced them, refuses `Set-Cookie` responses (a stored cookie
/// would replay one visitor's session to everyone), refuses event streams,
/// and refuses bodies of unknown or oversized length.
fn should_store_response(response: &Response, max_body_bytes: usize) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    HttpBody::size_hint(response.body())
        .upper()
        .is_some_and(|upper| upper <= max_body_bytes as u64)
}

/// Build a response from cached data.
fn build_response(page: CachedPage) -> Response {
    let mut builder = Response::builder().status(page.status);

    for (name, value) in page.headers {
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            builder = builder.header(name, header_value);
        }
    }

    builder
        .body(Body::from(page.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
