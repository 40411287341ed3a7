//! Runs the web app against the upstream fixture server of `linkcache-test`.

use linkcache_service::config::{Config, EmoteSetConfig};
use linkcache_service::refresh::RefreshTask;
use linkcache_service::services::SharedServices;
use linkcache_test::{HitCounter, Server};

use crate::endpoints;

/// A running app, together with the services it keeps alive.
pub(crate) struct TestApp {
    server: Server,
    _refresh_task: RefreshTask,
}

impl TestApp {
    pub(crate) fn url(&self, path: &str) -> reqwest::Url {
        self.server.url(path)
    }
}

/// Starts the app with emote sets and links served by a fresh [`HitCounter`].
pub(crate) async fn server() -> (TestApp, HitCounter) {
    let upstream = HitCounter::new();
    let config = Config {
        connect_to_reserved_ips: true,
        emote_sets: EmoteSetConfig {
            url: upstream.url("emotes/sets.json"),
            ..EmoteSetConfig::default()
        },
        ..Config::default()
    };

    let (services, refresh_task) = SharedServices::create(&config).await.unwrap();
    let server = Server::with_router(endpoints::create_app(services));

    let app = TestApp {
        server,
        _refresh_task: refresh_task,
    };
    (app, upstream)
}
