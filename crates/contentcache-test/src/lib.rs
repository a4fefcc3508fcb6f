//! Helpers for testing the content cache and the `contentcache` binary.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    cache might still write into it. To avoid this, assign it to a variable in the test
//!    function (e.g. `let _cache_dir = contentcache_test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `contentcache` crates and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("contentcache=trace,contentcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A boxed fetcher future, as handed out by [`FetchCounter`].
pub type Fetch<T> = BoxFuture<'static, Result<T, String>>;

/// Creates fetchers and counts how often any of them was actually called.
#[derive(Debug, Clone, Default)]
pub struct FetchCounter {
    calls: Arc<AtomicUsize>,
}

impl FetchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of fetchers that have been called so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A fetcher that resolves to `value` after `delay`.
    pub fn returning<T>(
        &self,
        value: T,
        delay: Duration,
    ) -> impl FnOnce() -> Fetch<T> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || -> Fetch<T> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }

    /// A fetcher that fails with `error` after `delay`.
    pub fn failing<T>(
        &self,
        error: &str,
        delay: Duration,
    ) -> impl FnOnce() -> Fetch<T> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        let error = error.to_owned();
        move || -> Fetch<T> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Err(error)
            })
        }
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A JSON API server that counts the requests it receives.
///
/// Routes:
///  - `/json/*path`: responds with `{"path": <path>}`.
///  - `/delay/:time/*path`: like `/json/*path`, after waiting for the given humantime duration.
///  - `/respond_statuscode/:num/*tail`: responds with the given status code and no body.
///  - `/garbage_data/*tail`: responds with the tail as plain text.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/json/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    Json(json!({ "path": path }))
                }),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        Json(json!({ "path": path }))
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The JSON a [`HitCounter`] responds with on `/json/<path>`.
pub fn json_response(path: &str) -> Value {
    json!({ "path": path })
}
