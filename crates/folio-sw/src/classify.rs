//! Request classification: which partition and which strategy.
//!
//! Rules are evaluated in order and the first match wins; later rules are
//! defaults for whatever the earlier ones let through.

use http::Method;

use crate::config::{PartitionKind, PrecacheManifest, RouterConfig};
use crate::request::{Destination, Request};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "ico"];
const ASSET_EXTENSIONS: &[&str] = &["js", "css"];

/// How cache and network are consulted for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Prefer the stored response; fetch only on a miss.
    CacheFirst,
    /// Prefer the network; fall back to the stored response when offline.
    NetworkFirst,
    /// Answer from cache immediately and refresh it in the background.
    StaleWhileRevalidate,
}

/// Where a routed request is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub strategy: Strategy,
    pub partition: PartitionKind,
    /// Manifest entry the request path matched, if it was precached.
    pub precached: Option<String>,
}

impl Route {
    const fn new(strategy: Strategy, partition: PartitionKind) -> Self {
        Self {
            strategy,
            partition,
            precached: None,
        }
    }

    fn precached(entry: &str) -> Self {
        Self {
            precached: Some(entry.to_string()),
            ..Self::new(Strategy::CacheFirst, PartitionKind::Static)
        }
    }
}

/// Why a request is left to default browser handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    NonGetMethod,
    ExtensionScheme,
    ExcludedHost,
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Bypass(BypassReason),
    Route(Route),
}

/// Maps requests to routes.
#[derive(Debug, Clone)]
pub struct Classifier {
    precache: PrecacheManifest,
    excluded_hosts: Vec<String>,
    excluded_schemes: Vec<String>,
}

impl Classifier {
    pub fn new(
        precache: PrecacheManifest,
        excluded_hosts: Vec<String>,
        excluded_schemes: Vec<String>,
    ) -> Self {
        Self {
            precache,
            excluded_hosts,
            excluded_schemes,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.precache.clone(),
            config.excluded_hosts.clone(),
            config.excluded_schemes.clone(),
        )
    }

    pub fn classify(&self, request: &Request) -> Classification {
        match self.bypass_reason(request) {
            Some(reason) => Classification::Bypass(reason),
            None => Classification::Route(self.route(request)),
        }
    }

    fn bypass_reason(&self, request: &Request) -> Option<BypassReason> {
        if request.method != Method::GET {
            return Some(BypassReason::NonGetMethod);
        }

        let scheme = request.url.scheme();
        if self.excluded_schemes.iter().any(|s| s == scheme) {
            return Some(BypassReason::ExtensionScheme);
        }

        let host = request.url.host_str().unwrap_or_default();
        if self
            .excluded_hosts
            .iter()
            .any(|excluded| host.contains(excluded.as_str()))
        {
            return Some(BypassReason::ExcludedHost);
        }

        None
    }

    /// The routing table, without the exclusion checks.
    pub fn route(&self, request: &Request) -> Route {
        let path = request.url.path();

        if let Some(entry) = self.precache.matching(path) {
            return Route::precached(entry);
        }

        if request.destination == Destination::Image || has_extension(path, IMAGE_EXTENSIONS) {
            return Route::new(Strategy::CacheFirst, PartitionKind::Image);
        }

        if matches!(request.destination, Destination::Script | Destination::Style)
            || has_extension(path, ASSET_EXTENSIONS)
        {
            return Route::new(Strategy::StaleWhileRevalidate, PartitionKind::Runtime);
        }

        if request.destination == Destination::Document || request.is_navigation() {
            return Route::new(Strategy::NetworkFirst, PartitionKind::Runtime);
        }

        Route::new(Strategy::NetworkFirst, PartitionKind::Runtime)
    }
}

/// Case-insensitive check of the last path segment's extension.
fn has_extension(path: &str, extensions: &[&str]) -> bool {
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((_, ext)) => extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)),
        None => false,
    }
}
