//! Twitch emote sets, mirrored from a public feed.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{EmoteSetConfig, EmoteSetOverride};
use crate::refresh::{RefreshTable, RefreshTask, TableSource};

/// The channel an emote set belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSet {
    pub channel_name: String,
    pub channel_id: String,
    #[serde(rename = "type")]
    pub set_type: String,
    /// Whether this set was added locally rather than coming from the feed.
    #[serde(default)]
    pub custom: bool,
}

impl From<&EmoteSetOverride> for EmoteSet {
    fn from(set: &EmoteSetOverride) -> Self {
        Self {
            channel_name: set.channel_name.clone(),
            channel_id: set.channel_id.clone(),
            set_type: set.set_type.clone(),
            custom: true,
        }
    }
}

/// Downloads the emote set feed.
#[derive(Clone, Debug)]
pub struct EmoteSetSource {
    client: reqwest::Client,
    url: Url,
    overrides: BTreeMap<String, EmoteSetOverride>,
}

impl EmoteSetSource {
    pub fn new(client: reqwest::Client, config: &EmoteSetConfig) -> Self {
        Self {
            client,
            url: config.url.clone(),
            overrides: config.overrides.clone(),
        }
    }
}

impl TableSource for EmoteSetSource {
    type Record = EmoteSet;

    fn fetch(&self) -> BoxFuture<'static, anyhow::Result<HashMap<String, EmoteSet>>> {
        let client = self.client.clone();
        let url = self.url.clone();

        async move {
            tracing::debug!(%url, "Fetching emote sets");
            let response = client
                .get(url.clone())
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .with_context(|| format!("failed to download emote sets from {url}"))?;

            let body = response.bytes().await.context("failed to read emote sets")?;
            let sets: HashMap<String, EmoteSet> =
                serde_json::from_slice(&body).context("failed to parse emote sets")?;

            Ok(sets)
        }
        .boxed()
    }

    fn augment(&self, table: &mut HashMap<String, EmoteSet>) {
        // All sets in the feed are subscriber sets, regardless of what it says.
        for set in table.values_mut() {
            set.set_type = "sub".into();
        }

        for (id, set) in &self.overrides {
            table.insert(id.clone(), set.into());
        }
    }
}

pub type EmoteSetTable = RefreshTable<EmoteSetSource>;

/// Fetches the emote sets and keeps them up to date.
pub async fn start_emote_sets(
    client: reqwest::Client,
    config: &EmoteSetConfig,
) -> anyhow::Result<(EmoteSetTable, RefreshTask)> {
    let source = EmoteSetSource::new(client, config);
    RefreshTable::start("emote_sets", source, config.refresh_interval).await
}
