//! Registration contract between the page and the worker.

use std::time::{Duration, Instant};

use url::Url;

use crate::request::{CacheMode, Request};
use crate::{SwError, SwResult};

/// Whether update checks may be answered by the HTTP cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateViaCache {
    /// Imported scripts may come from the HTTP cache; the worker script may not.
    #[default]
    Imports,
    /// Both may come from the HTTP cache.
    All,
    /// Always go to the network.
    None,
}

/// Options for registering the worker.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Scope path, relative to the origin.
    pub scope: String,
    pub update_via_cache: UpdateViaCache,
}

impl RegistrationOptions {
    /// Site-wide registration whose update checks always hit the network.
    pub fn site_root() -> Self {
        Self {
            scope: "/".to_string(),
            update_via_cache: UpdateViaCache::None,
        }
    }
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self::site_root()
    }
}

/// A worker registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub scope: Url,
    pub script_url: Url,
    pub update_via_cache: UpdateViaCache,
    pub last_update_check: Option<Instant>,
}

impl Registration {
    /// Register `script_path` on `origin`.
    ///
    /// Both the script and the scope must resolve to the same origin.
    pub fn new(origin: &Url, script_path: &str, options: &RegistrationOptions) -> SwResult<Self> {
        let script_url = origin.join(script_path)?;
        let scope = origin.join(&options.scope)?;

        if script_url.origin() != origin.origin() || scope.origin() != origin.origin() {
            return Err(SwError::RegistrationFailed(format!(
                "script {} and scope {} must be on {}",
                script_url,
                scope,
                origin.origin().ascii_serialization()
            )));
        }

        Ok(Self {
            scope,
            script_url,
            update_via_cache: options.update_via_cache,
            last_update_check: None,
        })
    }

    /// Whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }

    /// Check if update is needed.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    pub fn mark_checked(&mut self) {
        self.last_update_check = Some(Instant::now());
    }

    /// Request used to check the worker script for updates.
    pub fn update_check_request(&self) -> Request {
        let cache = match self.update_via_cache {
            UpdateViaCache::All => CacheMode::Default,
            UpdateViaCache::Imports | UpdateViaCache::None => CacheMode::NoCache,
        };
        Request::get(self.script_url.clone()).with_cache_mode(cache)
    }
}
