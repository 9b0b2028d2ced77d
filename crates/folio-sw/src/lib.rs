//! # Folio Service Worker
//!
//! Offline cache router for the Folio portfolio site.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the app shell), activate (purge stale
//!   partitions, claim clients), fetch, background sync
//! - **Partitions**: `static`, `runtime` and `images`, versioned by a typed
//!   [`CacheVersion`]
//! - **Strategies**: cache-first, network-first, stale-while-revalidate,
//!   chosen per request by the [`Classifier`]
//! - **Offline fallback**: navigations degrade to the precached root document,
//!   then to a synthesized 503
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── Classifier ── Request → Bypass | Route { strategy, partition }
//!     ├── strategy::{cache_first, network_first, stale_while_revalidate}
//!     ├── Fetcher (HttpFetcher over reqwest, or a test double)
//!     ├── Clients (claimed on activate)
//!     └── CacheStorage
//!             └── Partition ("portfolio-static-v1", ...)
//!                     └── RequestKey → CachedEntry
//! ```

use thiserror::Error;

pub mod classify;
pub mod config;
pub mod fetcher;
pub mod registration;
pub mod request;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use classify::{BypassReason, Classification, Classifier, Route, Strategy};
pub use config::{CacheVersion, PartitionKind, PartitionNames, PrecacheManifest, RouterConfig};
pub use fetcher::{Fetcher, HttpFetcher};
pub use registration::{Registration, RegistrationOptions, UpdateViaCache};
pub use request::{CacheMode, Destination, Request, RequestMode, Response};
pub use storage::{CacheStorage, CachedEntry, Partition, RequestKey};
pub use worker::{
    Client, Clients, InstallReport, ServiceWorker, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerState,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Precache failed: {0}")]
    Precache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

/// Result alias for service worker operations.
pub type SwResult<T> = Result<T, SwError>;
