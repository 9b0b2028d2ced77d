//! Folio Smoke Harness
//!
//! Drives a real service worker against a live origin: install, activate,
//! then fetch each requested path twice so the second pass shows what the
//! partitions now serve. Prints a JSON summary on stdout.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use folio_common::{init_logging, LogConfig, LogFormat};
use folio_sw::{
    CacheStorage, CacheVersion, Destination, Fetcher, HttpFetcher, Registration,
    RegistrationOptions, Request, RouterConfig, ServiceWorker,
};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

/// Parse command line arguments
struct Args {
    config: Option<String>,
    origin: Option<String>,
    version: Option<String>,
    log_filter: Option<String>,
    json_logs: bool,
    paths: Vec<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Args {
            config: None,
            origin: None,
            version: None,
            log_filter: None,
            json_logs: false,
            paths: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = Some(args.next().context("--config needs a path")?),
                "--origin" => parsed.origin = Some(args.next().context("--origin needs a URL")?),
                "--version" => parsed.version = Some(args.next().context("--version needs a tag")?),
                "--log" => parsed.log_filter = Some(args.next().context("--log needs a filter")?),
                "--json-logs" => parsed.json_logs = true,
                "--help" | "-h" => {
                    eprintln!(
                        "usage: folio-smoke [--config FILE] [--origin URL] [--version TAG] \
                         [--log FILTER] [--json-logs] [PATH...]"
                    );
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
                path => parsed.paths.push(path.to_string()),
            }
        }

        Ok(parsed)
    }

    fn router_config(&self) -> Result<RouterConfig> {
        let mut config = match (&self.config, &self.origin) {
            (Some(path), _) => RouterConfig::load(path)?,
            (None, Some(origin)) => RouterConfig::new(Url::parse(origin)?),
            (None, None) => bail!("either --config or --origin is required"),
        };
        if let Some(origin) = &self.origin {
            config.origin = Url::parse(origin)?;
        }
        if let Some(version) = &self.version {
            config.version = CacheVersion::new(version.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// Guess the request destination from the path, as the page would report it.
fn destination_for(path: &str) -> Destination {
    let lower = path.to_ascii_lowercase();
    if [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        Destination::Image
    } else if lower.ends_with(".js") {
        Destination::Script
    } else if lower.ends_with(".css") {
        Destination::Style
    } else {
        Destination::Document
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;

    let mut log_config = LogConfig::default();
    if args.json_logs {
        log_config = log_config.with_format(LogFormat::Json);
    }
    if let Some(filter) = &args.log_filter {
        log_config = log_config.with_filter(filter.clone());
    }
    init_logging(log_config)?;

    let config = args.router_config()?;
    let registration = Registration::new(&config.origin, "/sw.js", &RegistrationOptions::site_root())?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);

    match fetcher.fetch(registration.update_check_request()).await {
        Ok(response) => info!(status = %response.status, url = %registration.script_url, "Update check"),
        Err(err) => warn!(error = %err, "Update check failed"),
    }

    let (worker, _events) = ServiceWorker::new(config.clone(), CacheStorage::new(), fetcher);

    let started = Instant::now();
    let install = worker.install().await;
    let purged = worker.activate().await;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Worker active");

    let paths = if args.paths.is_empty() {
        config.precache.paths().to_vec()
    } else {
        args.paths.clone()
    };

    let mut results = Vec::new();
    for pass in 1..=2 {
        for path in &paths {
            let url = config.origin.join(path)?;
            if !registration.in_scope(&url) {
                warn!(url = %url, "Out of scope, skipping");
                continue;
            }

            let destination = destination_for(url.path());
            let request = if destination == Destination::Document {
                Request::navigate(url.clone())
            } else {
                Request::get(url.clone()).with_destination(destination)
            };

            let started = Instant::now();
            let outcome = match worker.handle_fetch(request).await {
                Ok(Some(response)) => json!({
                    "status": response.status.as_u16(),
                    "from_cache": response.from_cache,
                    "bytes": response.body.len(),
                }),
                Ok(None) => json!({ "intercepted": false }),
                Err(err) => json!({ "error": err.to_string() }),
            };
            results.push(json!({
                "pass": pass,
                "url": url.as_str(),
                "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
                "outcome": outcome,
            }));
        }
        worker.wait_for_background().await;
    }

    let mut partitions = serde_json::Map::new();
    for name in worker.storage().keys().await {
        let count = worker.storage().entry_count(&name).await;
        partitions.insert(name, json!(count));
    }

    let summary = json!({
        "origin": config.origin.as_str(),
        "version": config.version.as_str(),
        "install": {
            "precached": install.precached,
            "skip_waiting": install.skip_waiting,
            "error": install.error.map(|e| e.to_string()),
        },
        "purged": purged,
        "partitions": partitions,
        "requests": results,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
