use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level of linkcache itself.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "linkcache".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of the `/thumbnail` resolver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// How long results are kept if the resolver does not ask for anything else.
    ///
    /// This applies to all negative results ("no link info found", "response too large", ...).
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// How long a successfully generated thumbnail is kept.
    #[serde(with = "humantime_serde")]
    pub success_ttl: Duration,

    /// Maximum width or height, in pixels, a thumbnail is resized to.
    pub max_size: u32,

    /// Upstream responses larger than this many bytes are rejected.
    pub max_content_length: u64,

    /// Content types for which thumbnails are generated.
    pub supported_content_types: Vec<String>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(10 * 60),
            success_ttl: Duration::from_secs(10 * 60),
            max_size: 300,
            max_content_length: 5 * 1024 * 1024,
            supported_content_types: vec![
                "image/jpeg".into(),
                "image/png".into(),
                "image/gif".into(),
            ],
        }
    }
}

/// A manually curated emote set that the upstream feed does not know about.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct EmoteSetOverride {
    pub channel_name: String,
    pub channel_id: String,
    #[serde(rename = "type")]
    pub set_type: String,
}

/// Settings of the periodically refreshed emote set table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EmoteSetConfig {
    /// The feed containing all emote sets, keyed by emote set ID.
    pub url: Url,

    /// Time between the end of one refresh and the start of the next one.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Emote sets inserted after every refresh, overwriting upstream records with the same ID.
    pub overrides: BTreeMap<String, EmoteSetOverride>,
}

impl Default for EmoteSetConfig {
    fn default() -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "13985".to_owned(),
            EmoteSetOverride {
                channel_name: "evohistorical2015".into(),
                channel_id: "129284508".into(),
                set_type: "sub".into(),
            },
        );

        Self {
            url: Url::parse("https://twitchemotes.com/api_cache/v3/sets.json")
                .expect("default emote set url is valid"),
            refresh_interval: Duration::from_secs(30 * 60),
            overrides,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Allow fetching thumbnails from reserved IP addresses (loopback, private networks, ...).
    pub connect_to_reserved_ips: bool,

    /// The `User-Agent` sent with every upstream request.
    pub user_agent: String,

    /// The timeout for establishing a connection to an upstream server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single upstream request, including reading the body, may take.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The `/thumbnail` resolver.
    pub thumbnails: ThumbnailConfig,

    /// The `/twitchemotes/set` table.
    pub emote_sets: EmoteSetConfig,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        "0.0.0.0:1234".to_owned()
    } else {
        "127.0.0.1:1234".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            connect_to_reserved_ips: false,
            user_agent: concat!("linkcache/", env!("CARGO_PKG_VERSION")).to_owned(),
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(30),
            thumbnails: ThumbnailConfig::default(),
            emote_sets: EmoteSetConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.parse().map_err(|_| {
            de::Error::unknown_variant(v, &["off", "error", "warn", "info", "debug", "trace"])
        })
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
