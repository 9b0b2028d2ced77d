//! Router configuration: cache identity, precache manifest and exclusions.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{SwError, SwResult};

/// Version tag shared by all three partition names.
///
/// Bumping it on deploy creates fresh partitions; `activate` then purges the
/// ones carrying the old tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self::new("v1")
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// App shell assets from the precache manifest.
    Static,
    /// Scripts, styles, documents and everything else.
    Runtime,
    /// Image assets.
    Image,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Runtime, Self::Image];

    /// Label used inside the partition name.
    pub fn label(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Runtime => "runtime",
            Self::Image => "images",
        }
    }
}

/// The three live partition names for one cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    static_name: String,
    runtime_name: String,
    image_name: String,
}

impl PartitionNames {
    /// Build `<prefix>-<label>-<version>` for every partition kind.
    pub fn new(prefix: &str, version: &CacheVersion) -> Self {
        let name = |kind: PartitionKind| format!("{}-{}-{}", prefix, kind.label(), version);
        Self {
            static_name: name(PartitionKind::Static),
            runtime_name: name(PartitionKind::Runtime),
            image_name: name(PartitionKind::Image),
        }
    }

    pub fn name(&self, kind: PartitionKind) -> &str {
        match kind {
            PartitionKind::Static => &self.static_name,
            PartitionKind::Runtime => &self.runtime_name,
            PartitionKind::Image => &self.image_name,
        }
    }

    /// Whether `name` is one of the current partitions.
    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        PartitionKind::ALL.into_iter().map(move |kind| self.name(kind))
    }
}

/// Paths that must be cached before the worker counts as installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecacheManifest(Vec<String>);

impl PrecacheManifest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact or suffix match of a URL path against any manifest entry.
    ///
    /// Note that `/` suffix-matches every directory-style path.
    pub fn matches(&self, path: &str) -> bool {
        self.matching(path).is_some()
    }

    /// The manifest entry `path` is served from: an exact match if there is
    /// one, otherwise the first entry it ends with.
    pub fn matching(&self, path: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|asset| path == asset.as_str())
            .or_else(|| self.0.iter().find(|asset| path.ends_with(asset.as_str())))
            .map(String::as_str)
    }
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self::new([
            "/",
            "/index.html",
            "/manifest.json",
            "/icon-192.png",
            "/icon-512.png",
            "/favicon.svg",
        ])
    }
}

/// Service worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Origin the manifest paths are resolved against.
    pub origin: Url,

    /// Prefix of every partition name.
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Version suffix of every partition name.
    #[serde(default)]
    pub version: CacheVersion,

    /// Assets cached at install time.
    #[serde(default)]
    pub precache: PrecacheManifest,

    /// Precached document served to offline navigations.
    #[serde(default = "default_offline_document")]
    pub offline_document: String,

    /// Host substrings that are never intercepted (form backend API).
    #[serde(default = "default_excluded_hosts")]
    pub excluded_hosts: Vec<String>,

    /// Browser-extension URL schemes that are never intercepted.
    #[serde(default = "default_excluded_schemes")]
    pub excluded_schemes: Vec<String>,

    /// Background sync tag the worker accepts.
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,
}

fn default_cache_prefix() -> String {
    "portfolio".to_string()
}

fn default_offline_document() -> String {
    "/index.html".to_string()
}

fn default_excluded_hosts() -> Vec<String> {
    vec!["supabase.co".to_string()]
}

fn default_excluded_schemes() -> Vec<String> {
    vec!["chrome-extension".to_string(), "moz-extension".to_string()]
}

fn default_sync_tag() -> String {
    "background-sync".to_string()
}

impl RouterConfig {
    /// Default configuration for a site served from `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_prefix: default_cache_prefix(),
            version: CacheVersion::default(),
            precache: PrecacheManifest::default(),
            offline_document: default_offline_document(),
            excluded_hosts: default_excluded_hosts(),
            excluded_schemes: default_excluded_schemes(),
            sync_tag: default_sync_tag(),
        }
    }

    pub fn with_version(mut self, version: CacheVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_precache(mut self, precache: PrecacheManifest) -> Self {
        self.precache = precache;
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> SwResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SwError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject entries that would match every request.
    ///
    /// An empty manifest path suffix-matches every path and an empty host
    /// matches every host.
    pub fn validate(&self) -> SwResult<()> {
        if self.cache_prefix.is_empty() {
            return Err(SwError::Config("cache_prefix is empty".to_string()));
        }
        if self.version.as_str().is_empty() {
            return Err(SwError::Config("version is empty".to_string()));
        }
        if let Some(i) = self.precache.paths().iter().position(|p| p.is_empty()) {
            return Err(SwError::Config(format!("precache[{i}] is empty")));
        }
        if self.offline_document.is_empty() {
            return Err(SwError::Config("offline_document is empty".to_string()));
        }
        if let Some(i) = self.excluded_hosts.iter().position(|h| h.is_empty()) {
            return Err(SwError::Config(format!("excluded_hosts[{i}] is empty")));
        }
        if let Some(i) = self.excluded_schemes.iter().position(|s| s.is_empty()) {
            return Err(SwError::Config(format!("excluded_schemes[{i}] is empty")));
        }
        Ok(())
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> SwResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SwError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn partition_names(&self) -> PartitionNames {
        PartitionNames::new(&self.cache_prefix, &self.version)
    }

    /// Absolute URLs of the precache manifest, in manifest order.
    pub fn precache_urls(&self) -> SwResult<Vec<Url>> {
        self.precache
            .paths()
            .iter()
            .map(|path| self.origin.join(path).map_err(SwError::from))
            .collect()
    }

    pub fn offline_document_url(&self) -> SwResult<Url> {
        Ok(self.origin.join(&self.offline_document)?)
    }
}
