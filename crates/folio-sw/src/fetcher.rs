//! Network access for the router.

use futures::future::BoxFuture;
use futures::FutureExt;
use http::{header, HeaderValue};
use reqwest::Client;
use tracing::trace;

use crate::request::{Request, Response};
use crate::{SwError, SwResult};

/// Issues network requests on behalf of the router.
///
/// A returned `Err` means the request never produced a response (offline,
/// DNS failure, reset connection). HTTP error statuses are `Ok` responses.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, request: Request) -> BoxFuture<'static, SwResult<Response>>;
}

/// [`Fetcher`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> SwResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("folio-sw/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SwError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'static, SwResult<Response>> {
        let client = self.client.clone();
        async move {
            trace!(method = %request.method, url = %request.url, "Network fetch");

            let mut builder = client
                .request(request.method, request.url)
                .headers(request.headers);
            if request.cache.bypasses_http_cache() {
                builder = builder.header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }

            let response = builder
                .send()
                .await
                .map_err(|e| SwError::Network(e.to_string()))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| SwError::Network(e.to_string()))?;

            Ok(Response {
                status,
                headers,
                body,
                from_cache: false,
            })
        }
        .boxed()
    }
}
