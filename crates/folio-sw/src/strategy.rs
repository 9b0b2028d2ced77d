//! The three caching strategies.
//!
//! Every function suspends at each cache lookup and network fetch. Only ok
//! responses are written back; error statuses are returned to the page as is.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fetcher::Fetcher;
use crate::request::{Request, Response};
use crate::storage::{CacheStorage, RequestKey};
use crate::{SwError, SwResult};

/// Work that outlives the fetch that started it (cache revalidation).
///
/// Tasks are detached: dropping this set, or a `settle` future part-way
/// through, never aborts them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Forget finished tasks so the list doesn't grow with every request.
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(task));
    }

    /// Wait for every task spawned so far.
    ///
    /// If this future is dropped early, the tasks it had not yet waited on
    /// keep running but a later `settle` no longer waits for them.
    pub async fn settle(&self) {
        let pending = std::mem::take(&mut *self.tasks.lock().await);
        for handle in pending {
            if let Err(err) = handle.await {
                warn!(error = %err, "Background task failed");
            }
        }
    }
}

/// Write an ok response back to the partition. Non-ok responses are skipped.
async fn store(storage: &CacheStorage, partition: &str, key: RequestKey, response: &Response) {
    if !response.ok() {
        debug!(partition, url = key.url(), status = %response.status, "Not caching failed response");
        return;
    }
    if let Err(err) = storage.put(partition, key, response).await {
        warn!(partition, error = %err, "Cache write failed");
    }
}

/// Serve from the partition; fetch and store only on a miss.
///
/// `alias` is a second key the request may be stored under, such as the
/// precache manifest entry its path matched. It is consulted after the
/// request's own key; a fetched response is stored under the request's key.
pub async fn cache_first(
    storage: &CacheStorage,
    fetcher: &Arc<dyn Fetcher>,
    partition: &str,
    request: &Request,
    alias: Option<&RequestKey>,
) -> SwResult<Response> {
    let key = RequestKey::for_request(request);
    for candidate in std::iter::once(&key).chain(alias) {
        if let Some(hit) = storage.match_in(partition, candidate).await {
            debug!(partition, url = %request.url, key = candidate.url(), "Cache hit");
            return Ok(hit);
        }
    }

    debug!(partition, url = %request.url, "Cache miss, fetching");
    let response = fetcher.fetch(request.clone()).await?;
    store(storage, partition, key, &response).await;
    Ok(response)
}

/// Fetch first; on a network failure fall back to the partition.
pub async fn network_first(
    storage: &CacheStorage,
    fetcher: &Arc<dyn Fetcher>,
    partition: &str,
    request: &Request,
) -> SwResult<Response> {
    let key = RequestKey::for_request(request);
    match fetcher.fetch(request.clone()).await {
        Ok(response) => {
            store(storage, partition, key, &response).await;
            Ok(response)
        }
        Err(err) => {
            debug!(partition, url = %request.url, error = %err, "Network failed, trying cache");
            match storage.match_in(partition, &key).await {
                Some(hit) => Ok(hit),
                None => Err(err),
            }
        }
    }
}

/// Serve the cached entry immediately and refresh it in the background.
///
/// On a miss the refresh is awaited and its result returned. The refreshed
/// entry is only visible to later requests.
pub async fn stale_while_revalidate(
    storage: &CacheStorage,
    fetcher: &Arc<dyn Fetcher>,
    background: &BackgroundTasks,
    partition: &str,
    request: &Request,
) -> SwResult<Response> {
    let key = RequestKey::for_request(request);
    let cached = storage.match_in(partition, &key).await;

    let refresh = {
        let storage = storage.clone();
        let fetcher = Arc::clone(fetcher);
        let partition = partition.to_string();
        let request = request.clone();
        async move {
            let response = fetcher.fetch(request).await?;
            store(&storage, &partition, key, &response).await;
            Ok::<_, SwError>(response)
        }
    };

    match cached {
        Some(hit) => {
            debug!(partition, url = %request.url, "Serving stale, revalidating");
            let url = request.url.clone();
            background
                .spawn(async move {
                    if let Err(err) = refresh.await {
                        debug!(url = %url, error = %err, "Revalidation failed");
                    }
                })
                .await;
            Ok(hit)
        }
        None => {
            debug!(partition, url = %request.url, "Cache miss, fetching");
            refresh.await
        }
    }
}
