//! End-to-end behaviour of the router against a scripted network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use folio_sw::{
    CacheStorage, CacheVersion, Client, Destination, Fetcher, PartitionKind, Request, RequestKey,
    Response, RouterConfig, ServiceWorker, ServiceWorkerEvent, ServiceWorkerState, SwError,
    SwResult,
};
use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use http::{Method, StatusCode};
use url::Url;

const ORIGIN: &str = "https://folio.example/";

/// Network double: scripted replies, a call log and an offline switch.
///
/// In numbered mode every request gets a fresh `reply-<n>` body instead.
#[derive(Default)]
struct MockNetwork {
    replies: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    numbered: AtomicBool,
    sent: AtomicUsize,
}

impl MockNetwork {
    fn serve(&self, path: &str, status: StatusCode, body: &'static str) {
        self.replies
            .lock()
            .unwrap()
            .insert(url(path).to_string(), (status, Bytes::from_static(body.as_bytes())));
    }

    fn serve_shell(&self) {
        self.serve("/", StatusCode::OK, "<html>home</html>");
        self.serve("/index.html", StatusCode::OK, "<html>index</html>");
        self.serve("/manifest.json", StatusCode::OK, "{\"name\":\"Folio\"}");
        self.serve("/icon-192.png", StatusCode::OK, "png-192");
        self.serve("/icon-512.png", StatusCode::OK, "png-512");
        self.serve("/favicon.svg", StatusCode::OK, "<svg/>");
    }

    fn number_replies(&self) {
        self.numbered.store(true, Ordering::SeqCst);
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Fetcher for MockNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'static, SwResult<Response>> {
        let url = request.url.to_string();
        self.calls.lock().unwrap().push(url.clone());

        let result = if self.offline.load(Ordering::SeqCst) {
            Err(SwError::Network(format!("offline: {url}")))
        } else if self.numbered.load(Ordering::SeqCst) {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(Response::ok_with(format!("reply-{n}")))
        } else {
            let reply = self.replies.lock().unwrap().get(&url).cloned();
            let (status, body) = reply.unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));
            Ok(Response::new(status, body))
        };
        futures::future::ready(result).boxed()
    }
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config() -> RouterConfig {
    RouterConfig::new(Url::parse(ORIGIN).unwrap())
}

fn worker_on(
    config: RouterConfig,
    storage: &CacheStorage,
    network: &Arc<MockNetwork>,
) -> (ServiceWorker, tokio::sync::mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    let fetcher: Arc<dyn Fetcher> = network.clone();
    ServiceWorker::new(config, storage.clone(), fetcher)
}

/// Installed and activated worker with the app shell precached.
async fn active_worker(network: &Arc<MockNetwork>) -> ServiceWorker {
    network.serve_shell();
    let (worker, _events) = worker_on(config(), &CacheStorage::new(), network);
    let report = worker.install().await;
    assert!(report.error.is_none(), "precache failed: {:?}", report.error);
    worker.activate().await;
    worker
}

async fn fetch(worker: &ServiceWorker, request: Request) -> SwResult<Response> {
    worker
        .handle_fetch(request)
        .await
        .map(|r| r.expect("request should be intercepted"))
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn precached_assets_are_served_without_network() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.reset_calls();

    for path in ["/", "/index.html", "/manifest.json", "/icon-192.png", "/favicon.svg"] {
        let response = fetch(&worker, Request::get(url(path))).await.unwrap();
        assert!(response.from_cache, "{path} should come from cache");
        assert!(response.ok());
    }

    assert_eq!(network.call_count(), 0);
}

#[tokio::test]
async fn suffix_matched_manifest_entry_is_served_offline() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.reset_calls();
    network.set_offline(true);

    let response = fetch(&worker, Request::get(url("/nested/manifest.json")))
        .await
        .unwrap();

    assert!(response.from_cache);
    assert_eq!(response.body, Bytes::from("{\"name\":\"Folio\"}"));
    assert_eq!(network.call_count(), 0);
}

#[tokio::test]
async fn install_precaches_and_skips_waiting() {
    let network = Arc::new(MockNetwork::default());
    network.serve_shell();
    let (worker, mut events) = worker_on(config(), &CacheStorage::new(), &network);

    let report = worker.install().await;

    assert_eq!(report.precached, 6);
    assert!(report.skip_waiting);
    assert!(worker.skip_waiting_requested());
    assert_eq!(worker.state().await, ServiceWorkerState::Installed);
    let static_name = worker.partition_names().name(PartitionKind::Static);
    assert_eq!(worker.storage().entry_count(static_name).await, 6);

    let states: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![ServiceWorkerState::Installing, ServiceWorkerState::Installed]
    );
}

#[tokio::test]
async fn failed_precache_writes_nothing_but_still_installs() {
    let network = Arc::new(MockNetwork::default());
    network.serve_shell();
    network.serve("/icon-512.png", StatusCode::NOT_FOUND, "");
    let (worker, _events) = worker_on(config(), &CacheStorage::new(), &network);

    let report = worker.install().await;

    assert!(matches!(report.error, Some(SwError::Precache(_))));
    assert!(!report.skip_waiting);
    assert!(!worker.skip_waiting_requested());
    assert_eq!(worker.state().await, ServiceWorkerState::Installed);
    let static_name = worker.partition_names().name(PartitionKind::Static);
    assert_eq!(worker.storage().entry_count(static_name).await, 0);
}

#[tokio::test]
async fn cached_image_survives_network_failure() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.serve("/projects/hero.webp", StatusCode::OK, "webp-bytes");

    let request = Request::get(url("/projects/hero.webp")).with_destination(Destination::Image);
    let first = fetch(&worker, request.clone()).await.unwrap();
    assert!(!first.from_cache);

    network.set_offline(true);
    let second = fetch(&worker, request).await.unwrap();

    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    let image_name = worker.partition_names().name(PartitionKind::Image);
    assert_eq!(worker.storage().entry_count(image_name).await, 1);
}

#[tokio::test]
async fn stale_while_revalidate_serves_stale_then_fresh() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    let runtime_name = worker.partition_names().name(PartitionKind::Runtime);
    let request = Request::get(url("/assets/app.js")).with_destination(Destination::Script);

    worker
        .storage()
        .put(
            runtime_name,
            RequestKey::for_request(&request),
            &Response::ok_with("console.log('A')"),
        )
        .await
        .unwrap();
    network.serve("/assets/app.js", StatusCode::OK, "console.log('B')");

    let stale = fetch(&worker, request.clone()).await.unwrap();
    assert_eq!(stale.text(), "console.log('A')");
    assert!(stale.from_cache);

    worker.wait_for_background().await;

    let fresh = fetch(&worker, request).await.unwrap();
    assert_eq!(fresh.text(), "console.log('B')");
    assert!(fresh.from_cache);
}

#[tokio::test]
async fn stale_while_revalidate_miss_waits_for_network() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.serve("/assets/site.css", StatusCode::OK, "body{}");

    let response = fetch(&worker, Request::get(url("/assets/site.css"))).await.unwrap();
    assert_eq!(response.text(), "body{}");
    assert!(!response.from_cache);

    network.set_offline(true);
    let err = fetch(&worker, Request::get(url("/assets/other.css")))
        .await
        .unwrap_err();
    assert!(matches!(err, SwError::Network(_)));
}

#[tokio::test]
async fn network_first_writes_through_and_falls_back() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    let runtime_name = worker.partition_names().name(PartitionKind::Runtime);
    network.serve("/projects", StatusCode::OK, "<html>projects</html>");

    let online = fetch(&worker, Request::navigate(url("/projects"))).await.unwrap();
    assert_eq!(online.text(), "<html>projects</html>");
    assert!(!online.from_cache);
    assert_eq!(worker.storage().entry_count(runtime_name).await, 1);

    network.set_offline(true);

    let cached = fetch(&worker, Request::navigate(url("/projects"))).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.text(), "<html>projects</html>");

    let fallback = fetch(&worker, Request::navigate(url("/achievements"))).await.unwrap();
    assert!(fallback.from_cache);
    assert_eq!(fallback.text(), "<html>index</html>");
}

#[tokio::test]
async fn navigation_without_any_fallback_is_503() {
    let network = Arc::new(MockNetwork::default());
    let (worker, _events) = worker_on(config(), &CacheStorage::new(), &network);
    worker.install().await;
    worker.activate().await;
    network.set_offline(true);

    let response = fetch(&worker, Request::navigate(url("/about"))).await.unwrap();

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!response.from_cache);
}

#[tokio::test]
async fn non_navigation_failures_propagate() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.set_offline(true);

    let image = Request::get(url("/gallery/never-seen.png"));
    assert!(matches!(fetch(&worker, image).await, Err(SwError::Network(_))));

    let data = Request::get(url("/api/stats"));
    assert!(matches!(fetch(&worker, data).await, Err(SwError::Network(_))));
}

#[tokio::test]
async fn failed_responses_are_never_cached() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.serve("/img/broken.png", StatusCode::NOT_FOUND, "missing");
    network.serve("/api/stats", StatusCode::INTERNAL_SERVER_ERROR, "boom");
    network.serve("/assets/broken.css", StatusCode::INTERNAL_SERVER_ERROR, "boom");

    let cases = [
        (Request::get(url("/img/broken.png")), PartitionKind::Image, StatusCode::NOT_FOUND),
        (Request::get(url("/api/stats")), PartitionKind::Runtime, StatusCode::INTERNAL_SERVER_ERROR),
        (
            Request::get(url("/assets/broken.css")),
            PartitionKind::Runtime,
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (request, kind, status) in cases {
        let key = RequestKey::for_request(&request);
        let response = fetch(&worker, request).await.unwrap();
        assert_eq!(response.status, status);

        let partition = worker.partition_names().name(kind);
        assert!(worker.storage().match_in(partition, &key).await.is_none());
    }
}

#[tokio::test]
async fn failed_revalidation_keeps_stale_entry() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    let runtime_name = worker.partition_names().name(PartitionKind::Runtime);
    let request = Request::get(url("/assets/theme.css"));

    worker
        .storage()
        .put(runtime_name, RequestKey::for_request(&request), &Response::ok_with("old"))
        .await
        .unwrap();
    network.serve("/assets/theme.css", StatusCode::INTERNAL_SERVER_ERROR, "boom");

    assert_eq!(fetch(&worker, request.clone()).await.unwrap().text(), "old");
    worker.wait_for_background().await;
    assert_eq!(fetch(&worker, request).await.unwrap().text(), "old");
}

#[tokio::test]
async fn activation_purges_other_versions() {
    let network = Arc::new(MockNetwork::default());
    let storage = CacheStorage::new();
    for stale in ["portfolio-static-v0", "portfolio-images-v0", "unrelated-cache"] {
        storage.open(stale).await;
    }
    let (worker, mut events) = worker_on(config(), &storage, &network);
    for name in worker.partition_names().iter() {
        storage.open(name).await;
    }

    let purged = worker.activate().await;

    assert_eq!(
        purged,
        vec![
            "portfolio-images-v0".to_string(),
            "portfolio-static-v0".to_string(),
            "unrelated-cache".to_string(),
        ]
    );
    assert_eq!(
        storage.keys().await,
        vec![
            "portfolio-images-v1".to_string(),
            "portfolio-runtime-v1".to_string(),
            "portfolio-static-v1".to_string(),
        ]
    );
    let purge_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ServiceWorkerEvent::PartitionPurged { .. }))
        .count();
    assert_eq!(purge_events, 3);
}

#[tokio::test]
async fn version_bump_replaces_previous_worker_partitions() {
    let network = Arc::new(MockNetwork::default());
    network.serve_shell();
    let storage = CacheStorage::new();

    let (v1, _events) = worker_on(config(), &storage, &network);
    v1.install().await;
    v1.activate().await;

    let (v2, _events) = worker_on(
        config().with_version(CacheVersion::new("v2")),
        &storage,
        &network,
    );
    v2.install().await;
    v1.mark_redundant().await;
    let purged = v2.activate().await;

    assert_eq!(purged, vec!["portfolio-static-v1".to_string()]);
    assert!(storage.has("portfolio-static-v2").await);
    assert_eq!(storage.entry_count("portfolio-static-v2").await, 6);
    assert_eq!(v1.state().await, ServiceWorkerState::Redundant);
}

#[tokio::test]
async fn activation_claims_open_pages() {
    let network = Arc::new(MockNetwork::default());
    let (worker, mut events) = worker_on(config(), &CacheStorage::new(), &network);
    worker
        .clients()
        .write()
        .await
        .add(Client::new("tab-1", url("/")));

    worker.activate().await;

    assert_eq!(
        worker.clients().read().await.get("tab-1").unwrap().controller,
        Some(worker.id())
    );
    assert!(drain(&mut events).contains(&ServiceWorkerEvent::ControllerChange {
        client_id: "tab-1".to_string()
    }));
}

#[tokio::test]
async fn excluded_requests_are_not_intercepted() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;
    network.reset_calls();

    let post = Request::get(url("/contact")).with_method(Method::POST);
    let api = Request::get(Url::parse("https://abc.supabase.co/functions/v1/send").unwrap());
    let extension = Request::get(Url::parse("chrome-extension://abcdef/inject.js").unwrap());

    for request in [post, api, extension] {
        assert!(worker.handle_fetch(request).await.unwrap().is_none());
    }
    assert_eq!(network.call_count(), 0);
}

#[tokio::test]
async fn inactive_worker_does_not_intercept() {
    let network = Arc::new(MockNetwork::default());
    network.serve_shell();
    let (worker, _events) = worker_on(config(), &CacheStorage::new(), &network);
    worker.install().await;

    let response = worker.handle_fetch(Request::get(url("/index.html"))).await.unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn background_sync_resolves() {
    let network = Arc::new(MockNetwork::default());
    let worker = active_worker(&network).await;

    assert!(worker.handle_sync("background-sync").await.is_ok());
    assert!(worker.handle_sync("something-else").await.is_ok());
}

#[test]
fn worker_can_be_shared_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ServiceWorker>();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_on_one_key_leave_a_single_entry() {
    let network = Arc::new(MockNetwork::default());
    let worker = Arc::new(active_worker(&network).await);
    network.number_replies();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            worker
                .handle_fetch(Request::get(url("/photos/cover.png")))
                .await
        }));
    }

    let mut served = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap().unwrap().expect("image is intercepted");
        assert!(response.ok());
        served.push(response.body);
    }
    worker.wait_for_background().await;

    let images = worker.partition_names().name(PartitionKind::Image).to_string();
    assert_eq!(worker.storage().entry_count(&images).await, 1);

    let stored = worker
        .storage()
        .match_in(&images, &RequestKey::get(&url("/photos/cover.png")))
        .await
        .unwrap();
    let written: Vec<Bytes> = (0..network.sent.load(Ordering::SeqCst))
        .map(|n| Bytes::from(format!("reply-{n}")))
        .collect();
    assert!(written.contains(&stored.body), "stored body was never fetched");
    assert!(
        served.iter().all(|body| written.contains(body)),
        "every response came from a real fetch or the cache"
    );
}
