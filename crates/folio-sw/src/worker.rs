//! The service worker: lifecycle, fetch routing and offline fallback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::classify::{Classification, Classifier, Strategy};
use crate::config::{PartitionKind, PartitionNames, RouterConfig};
use crate::fetcher::Fetcher;
use crate::request::{Request, Response};
use crate::storage::{CacheStorage, RequestKey};
use crate::strategy::{self, BackgroundTasks};
use crate::{SwError, SwResult};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceWorkerState {
    /// Created, install not yet run.
    #[default]
    Parsed,
    /// Precaching the app shell.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Purging stale partitions.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced by a newer worker.
    Redundant,
}

impl ServiceWorkerState {
    /// Only an active worker receives fetch events.
    pub fn can_intercept_fetch(self) -> bool {
        self == Self::Activated
    }
}

/// Events emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A partition from another cache version was deleted.
    PartitionPurged { name: String },
    /// A page is now controlled by this worker.
    ControllerChange { client_id: String },
}

/// A page the worker may control.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Worker currently controlling the page, if any.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            controller: None,
        }
    }
}

/// Open pages within the worker's scope.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Take control of every page not already controlled by `worker`.
    /// Returns the ids of pages whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}

/// Result of the install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Entries written to the static partition.
    pub precached: usize,
    /// Whether the worker asked to activate without waiting.
    pub skip_waiting: bool,
    /// Why precaching failed, if it did. Install completes either way.
    pub error: Option<SwError>,
}

/// The offline cache router.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: RouterConfig,
    names: PartitionNames,
    classifier: Classifier,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    state: RwLock<ServiceWorkerState>,
    skip_waiting: AtomicBool,
    background: BackgroundTasks,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker over `storage`, fetching through `fetcher`.
    pub fn new(
        config: RouterConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = Self {
            id: ServiceWorkerId::new(),
            names: config.partition_names(),
            classifier: Classifier::from_config(&config),
            config,
            storage,
            fetcher,
            clients: Arc::new(RwLock::new(Clients::new())),
            state: RwLock::new(ServiceWorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            background: BackgroundTasks::new(),
            event_tx,
        };
        (worker, event_rx)
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn partition_names(&self) -> &PartitionNames {
        &self.names
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Whether install asked to skip the waiting phase.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    async fn set_state(&self, new_state: ServiceWorkerState) {
        *self.state.write().await = new_state;
        info!(worker = self.id.0, state = ?new_state, "Service worker state change");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }

    /// Mark this worker as replaced.
    pub async fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant).await;
    }

    /// Install: precache the manifest into the static partition.
    ///
    /// A failed precache is logged and reported; the worker still moves to
    /// `Installed` but only requests skip-waiting on success.
    pub async fn install(&self) -> InstallReport {
        self.set_state(ServiceWorkerState::Installing).await;

        let static_name = self.names.name(PartitionKind::Static);
        self.storage.open(static_name).await;

        let report = match self.precache(static_name).await {
            Ok(precached) => {
                self.skip_waiting.store(true, Ordering::Release);
                info!(partition = static_name, precached, "Precache complete");
                InstallReport {
                    precached,
                    skip_waiting: true,
                    error: None,
                }
            }
            Err(err) => {
                error!(partition = static_name, error = %err, "Precache failed");
                InstallReport {
                    precached: 0,
                    skip_waiting: false,
                    error: Some(err),
                }
            }
        };

        self.set_state(ServiceWorkerState::Installed).await;
        report
    }

    /// Fetch every manifest asset and write them as one batch.
    async fn precache(&self, partition: &str) -> SwResult<usize> {
        let urls = self.config.precache_urls()?;
        let fetches = urls.into_iter().map(|url| {
            let request = Request::get(url);
            let key = RequestKey::for_request(&request);
            let fetch = self.fetcher.fetch(request);
            async move { (key, fetch.await) }
        });

        let mut batch = Vec::new();
        for (key, result) in join_all(fetches).await {
            let response = result.map_err(|e| SwError::Precache(format!("{}: {}", key.url(), e)))?;
            if !response.ok() {
                return Err(SwError::Precache(format!(
                    "{}: status {}",
                    key.url(),
                    response.status
                )));
            }
            batch.push((key, response));
        }

        let count = batch.len();
        self.storage
            .put_all(partition, batch)
            .await
            .map_err(|e| SwError::Precache(e.to_string()))?;
        Ok(count)
    }

    /// Activate: delete every partition that isn't one of the current three,
    /// then claim open pages. Returns the purged names.
    pub async fn activate(&self) -> Vec<String> {
        self.set_state(ServiceWorkerState::Activating).await;

        let mut purged = Vec::new();
        for name in self.storage.keys().await {
            if self.names.contains(&name) {
                continue;
            }
            if self.storage.delete(&name).await {
                info!(partition = %name, "Deleted stale partition");
                let _ = self.event_tx.send(ServiceWorkerEvent::PartitionPurged { name: name.clone() });
                purged.push(name);
            } else {
                warn!(partition = %name, "Stale partition vanished before deletion");
            }
        }

        let claimed = self.clients.write().await.claim(self.id);
        for client_id in claimed {
            debug!(client = %client_id, "Claimed client");
            let _ = self
                .event_tx
                .send(ServiceWorkerEvent::ControllerChange { client_id });
        }

        self.set_state(ServiceWorkerState::Activated).await;
        purged
    }

    /// Handle a fetch event.
    ///
    /// `Ok(None)` leaves the request to default browser handling. A failed
    /// navigation falls back to the precached root document, then to a 503.
    pub async fn handle_fetch(&self, request: Request) -> SwResult<Option<Response>> {
        if !self.state().await.can_intercept_fetch() {
            trace!(url = %request.url, "Worker not active, not intercepting");
            return Ok(None);
        }

        let route = match self.classifier.classify(&request) {
            Classification::Bypass(reason) => {
                trace!(url = %request.url, reason = ?reason, "Bypassing request");
                return Ok(None);
            }
            Classification::Route(route) => route,
        };

        let partition = self.names.name(route.partition);
        debug!(
            url = %request.url,
            strategy = ?route.strategy,
            partition,
            "Routing request"
        );

        let result = match route.strategy {
            Strategy::CacheFirst => {
                // Suffix matches are stored under the manifest entry's own URL.
                let alias = match route.precached.as_deref().map(|entry| request.url.join(entry)) {
                    Some(Ok(url)) => Some(RequestKey::get(&url)),
                    Some(Err(err)) => {
                        warn!(url = %request.url, error = %err, "Invalid precache entry");
                        None
                    }
                    None => None,
                };
                strategy::cache_first(
                    &self.storage,
                    &self.fetcher,
                    partition,
                    &request,
                    alias.as_ref(),
                )
                .await
            }
            Strategy::NetworkFirst => {
                strategy::network_first(&self.storage, &self.fetcher, partition, &request).await
            }
            Strategy::StaleWhileRevalidate => {
                strategy::stale_while_revalidate(
                    &self.storage,
                    &self.fetcher,
                    &self.background,
                    partition,
                    &request,
                )
                .await
            }
        };

        match result {
            Ok(response) => Ok(Some(response)),
            Err(err) if request.is_navigation() => {
                warn!(url = %request.url, error = %err, "Navigation failed, serving offline fallback");
                Ok(Some(self.offline_fallback().await))
            }
            Err(err) => Err(err),
        }
    }

    async fn offline_fallback(&self) -> Response {
        let static_name = self.names.name(PartitionKind::Static);
        let document = match self.config.offline_document_url() {
            Ok(url) => self.storage.match_in(static_name, &RequestKey::get(&url)).await,
            Err(err) => {
                warn!(error = %err, "Invalid offline document URL");
                None
            }
        };
        document.unwrap_or_else(Response::offline_unavailable)
    }

    /// Handle a background sync event. Accepted and resolved without work.
    pub async fn handle_sync(&self, tag: &str) -> SwResult<()> {
        if tag == self.config.sync_tag {
            debug!(tag, "Background sync accepted");
        } else {
            trace!(tag, "Ignoring unknown sync tag");
        }
        Ok(())
    }

    /// Wait for outstanding background revalidations.
    ///
    /// Cancelling this wait, or dropping the worker, leaves revalidations
    /// running to completion on the runtime.
    pub async fn wait_for_background(&self) {
        self.background.settle().await;
    }
}
