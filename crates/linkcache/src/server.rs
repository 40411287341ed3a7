use std::net::SocketAddr;

use anyhow::{Context, Result};
use linkcache_service::config::Config;
use linkcache_service::metric;
use linkcache_service::services::SharedServices;

use crate::endpoints;

/// Starts all services and the HTTP server based on the loaded config.
///
/// Runs until the server fails or the emote sets can no longer be refreshed.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("linkcache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    web_pool.block_on(serve(config))?;
    tracing::info!("System shutdown complete");

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {}", config.bind))?;

    let (services, mut refresh_task) = SharedServices::create(&config)
        .await
        .context("failed to create HTTP service state")?;

    let app = endpoints::create_app(services);
    let server = axum_server::bind(socket).serve(app.into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    tokio::select! {
        result = server => result.context("HTTP server failed"),
        result = refresh_task.wait() => result.context("emote sets are no longer refreshed"),
    }
}
