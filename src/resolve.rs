//! Locale and identity resolution.
//!
//! The middleware never inspects sessions or auth state itself; it asks these
//! narrow traits for the two request facts that participate in cache keys.

use axum::body::Body;
use axum::http::{Request, header};

const DEFAULT_LOCALE: &str = "en";

/// Resolves the locale a response will be rendered in.
pub trait LocaleResolver: Send + Sync {
    fn resolve(&self, request: &Request<Body>) -> String;
}

/// Resolves the authenticated user behind a request, if any.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, request: &Request<Body>) -> Option<i64>;
}

/// Locale from the primary subtag of the first `Accept-Language` entry.
///
/// `de-DE,de;q=0.9,en;q=0.8` resolves to `de`; a missing or wildcard header
/// falls back to the configured default.
pub struct AcceptLanguageLocale {
    fallback: String,
}

impl AcceptLanguageLocale {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
        }
    }
}

impl Default for AcceptLanguageLocale {
    fn default() -> Self {
        Self {
            fallback: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl LocaleResolver for AcceptLanguageLocale {
    fn resolve(&self, request: &Request<Body>) -> String {
        request
            .headers()
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|entry| entry.split(';').next())
            .and_then(|tag| tag.trim().split('-').next())
            .filter(|subtag| !subtag.is_empty() && *subtag != "*")
            .map(|subtag| subtag.to_ascii_lowercase())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Pins every request to a single locale.
pub struct FixedLocale {
    locale: String,
}

impl FixedLocale {
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }
}

impl LocaleResolver for FixedLocale {
    fn resolve(&self, _request: &Request<Body>) -> String {
        self.locale.clone()
    }
}

/// User id the host's auth middleware exposes as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

/// Identity from a [`UserId`] request extension.
///
/// The host inserts the extension upstream of the cache layer; requests
/// without one are treated as anonymous.
pub struct ExtensionIdentity;

impl IdentityResolver for ExtensionIdentity {
    fn resolve(&self, request: &Request<Body>) -> Option<i64> {
        request.extensions().get::<UserId>().map(|user| user.0)
    }
}

/// Treats every request as anonymous.
pub struct Anonymous;

impl IdentityResolver for Anonymous {
    fn resolve(&self, _request: &Request<Body>) -> Option<i64> {
        None
    }
}
