//! Cache storage: named partitions of request → response entries.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::request::{Request, Response};
use crate::{SwError, SwResult};

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: String,
}

impl RequestKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    /// Key of a GET for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedEntry {
    fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
        }
    }

    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            from_cache: true,
        }
    }
}

/// A single named cache.
#[derive(Debug, Default)]
pub struct Partition {
    name: String,
    entries: HashMap<RequestKey, CachedEntry>,
}

impl Partition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_request(&self, key: &RequestKey) -> Option<&CachedEntry> {
        self.entries.get(key)
    }

    /// Store an entry. An existing entry for the same key is replaced.
    pub fn put(&mut self, key: RequestKey, entry: CachedEntry) {
        self.entries.insert(key, entry);
    }

    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared handle to every partition.
///
/// Clones share the same storage. Individual operations are atomic; two
/// writers racing on one key resolve as last write wins.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    partitions: Arc<RwLock<HashMap<String, Partition>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a partition, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(name.to_string())
            .or_insert_with(|| Partition::new(name));
    }

    pub async fn has(&self, name: &str) -> bool {
        self.partitions.read().await.contains_key(name)
    }

    pub async fn delete(&self, name: &str) -> bool {
        self.partitions.write().await.remove(name).is_some()
    }

    /// Names of all partitions, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `key` in partition `name`. A missing partition is a miss.
    pub async fn match_in(&self, name: &str, key: &RequestKey) -> Option<Response> {
        let partitions = self.partitions.read().await;
        let hit = partitions
            .get(name)
            .and_then(|p| p.match_request(key))
            .map(CachedEntry::to_response);
        trace!(partition = name, url = key.url(), hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Store `response` under `key`, opening the partition if needed.
    ///
    /// Only ok (2xx) responses are accepted.
    pub async fn put(&self, name: &str, key: RequestKey, response: &Response) -> SwResult<()> {
        ensure_cacheable(&key, response)?;
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(name.to_string())
            .or_insert_with(|| Partition::new(name))
            .put(key, CachedEntry::from_response(response));
        Ok(())
    }

    /// Store a batch. Either every entry is written or none is.
    pub async fn put_all(&self, name: &str, batch: Vec<(RequestKey, Response)>) -> SwResult<()> {
        for (key, response) in &batch {
            ensure_cacheable(key, response)?;
        }
        let mut partitions = self.partitions.write().await;
        let partition = partitions
            .entry(name.to_string())
            .or_insert_with(|| Partition::new(name));
        for (key, response) in batch {
            partition.put(key, CachedEntry::from_response(&response));
        }
        Ok(())
    }

    /// Number of entries in a partition (0 if it doesn't exist).
    pub async fn entry_count(&self, name: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(name)
            .map_or(0, Partition::len)
    }
}

fn ensure_cacheable(key: &RequestKey, response: &Response) -> SwResult<()> {
    if key.method != Method::GET {
        return Err(SwError::Cache(format!(
            "refusing to cache {} {}",
            key.method, key.url
        )));
    }
    if !response.ok() {
        return Err(SwError::Cache(format!(
            "refusing to cache {} response for {}",
            response.status, key.url
        )));
    }
    Ok(())
}
