use axum::Router;
use axum::routing::get;
use linkcache_service::services::SharedServices;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod emote_sets;
mod error;
mod metrics;
mod thumbnail;

pub use error::ResponseError;
use metrics::MetricsLayer;

use emote_sets::handle_emote_set_request as emote_set;
use thumbnail::handle_thumbnail_request as thumbnail;

pub async fn healthcheck() -> &'static str {
    linkcache_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(services: SharedServices) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/thumbnail/{*url}", get(thumbnail))
        .route("/twitchemotes/set/{set_id}/", get(emote_set))
        .with_state(services)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
