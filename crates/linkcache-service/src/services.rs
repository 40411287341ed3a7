//! Creates the caches and tables behind the HTTP endpoints.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::emotes::{EmoteSetTable, start_emote_sets};
use crate::refresh::RefreshTask;
use crate::thumbnails::{ThumbnailCache, ThumbnailLoader};
use crate::utils::http::create_client;

/// Everything the endpoints need to answer requests.
///
/// Cloning is cheap, all clones share the same caches.
#[derive(Clone, Debug)]
pub struct SharedServices {
    pub thumbnails: ThumbnailCache,
    pub emote_sets: EmoteSetTable,
}

impl SharedServices {
    /// Creates all services according to `config`.
    ///
    /// This fetches the emote sets once before returning. The returned [`RefreshTask`] keeps them
    /// up to date and ends with an error once that fails.
    pub async fn create(config: &Config) -> Result<(Self, RefreshTask)> {
        let client = create_client(config).context("failed to create HTTP client")?;

        let thumbnails = ThumbnailLoader::new(client.clone(), config).into_cache();
        let (emote_sets, refresh_task) = start_emote_sets(client, &config.emote_sets)
            .await
            .context("failed to load emote sets")?;

        let services = Self {
            thumbnails,
            emote_sets,
        };

        Ok((services, refresh_task))
    }
}
