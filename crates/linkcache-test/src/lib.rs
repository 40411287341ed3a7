//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`HitCounter`], make sure that it is held until all requests to the server have
//!    been made. Dropping it stops the server, and all further connections to it fail. Assign it
//!    to a variable: `let server = HitCounter::new();`.
//!
//!  - The fixture server runs on localhost. Links pointing to it are only fetched when
//!    `Config::connect_to_reserved_ips` is enabled.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{self, OriginalUri, Request};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use image::{ImageBuffer, ImageFormat, Rgb};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the linkcache crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("linkcache=trace,linkcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Returns a port on localhost that nothing listens on.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
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

/// Encodes a gradient of the given size.
///
/// `format` is the file extension, `png` or `jpeg`.
pub fn image_fixture(format: &str, width: u32, height: u32) -> Option<Vec<u8>> {
    let format = ImageFormat::from_extension(format)?;
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });

    let mut encoded = Cursor::new(Vec::new());
    image.write_to(&mut encoded, format).ok()?;
    Some(encoded.into_inner())
}

/// The emote set feed served by [`HitCounter`] under `/emotes/sets.json`.
pub fn emote_sets_fixture() -> serde_json::Value {
    serde_json::json!({
        "0": {"channel_name": "twitch", "channel_id": "0", "type": "global"},
        "488737": {"channel_name": "forsen", "channel_id": "22484632", "type": "bits"},
        "13985": {"channel_name": "unknown", "channel_id": "1", "type": "sub"},
    })
}

/// An upstream web server counting the requests to every path.
///
/// Serves:
///  - `/image/{format}/{width}/{height}/{name}`: a generated `png` or `jpeg` image.
///  - `/corrupt/{name}`: garbage declared as `image/png`.
///  - `/large/{size}/{name}`: declares a `Content-Length` of `size` bytes and sends them.
///  - `/stream/{size}/{name}`: sends `size` bytes without declaring a length.
///  - `/delay/{time}/{*path}`: redirects to `/{path}` after `time` (e.g. `100ms`).
///  - `/redirect/{host}/{port}/{*path}`: redirects to `http://{host}:{port}/{path}`.
///  - `/respond_statuscode/{num}/{*tail}`: an empty response with the given status.
///  - `/garbage_data/{*tail}`: the tail as plain text.
///  - `/emotes/sets.json`: [`emote_sets_fixture`].
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
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
                "/image/{format}/{width}/{height}/{name}",
                get(
                    |extract::Path((format, width, height, _)): extract::Path<(
                        String,
                        u32,
                        u32,
                        String,
                    )>| async move {
                        match image_fixture(&format, width, height) {
                            Some(image) => {
                                let content_type = format!("image/{format}");
                                ([(header::CONTENT_TYPE, content_type)], image).into_response()
                            }
                            None => StatusCode::NOT_FOUND.into_response(),
                        }
                    },
                ),
            )
            .route(
                "/corrupt/{name}",
                get(|| async move {
                    ([(header::CONTENT_TYPE, "image/png")], "definitely not a png")
                }),
            )
            .route(
                "/large/{size}/{name}",
                get(
                    |extract::Path((size, _)): extract::Path<(usize, String)>| async move {
                        ([(header::CONTENT_TYPE, "image/png")], vec![0u8; size])
                    },
                ),
            )
            .route(
                "/stream/{size}/{name}",
                get(
                    |extract::Path((size, _)): extract::Path<(usize, String)>| async move {
                        let chunk = 64 * 1024;
                        let chunks = (0..size.div_ceil(chunk)).map(move |i| {
                            let len = chunk.min(size - i * chunk);
                            Ok::<_, std::io::Error>(vec![0u8; len])
                        });
                        let body = Body::from_stream(futures::stream::iter(chunks));
                        ([(header::CONTENT_TYPE, "image/png")], body)
                    },
                ),
            )
            .route(
                "/delay/{time}/{*path}",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{}", path))])
                    },
                ),
            )
            .route(
                "/redirect/{host}/{port}/{*path}",
                get(
                    |extract::Path((host, port, path)): extract::Path<(
                        String,
                        u16,
                        String,
                    )>| async move {
                        let location = format!("http://{host}:{port}/{path}");
                        (StatusCode::FOUND, [("Location", location)])
                    },
                ),
            )
            .route(
                "/respond_statuscode/{num}/{*tail}",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/{*tail}",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/emotes/sets.json",
                get(|| async move { axum::Json(emote_sets_fixture()) }),
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
