//! Thumbnails of images behind arbitrary links.
//!
//! The [`ThumbnailLoader`] downloads the image a link points to, shrinks it and re-encodes it
//! as WebP. Everything that goes wrong along the way is answered with a cached JSON
//! [`LinkResolverResponse`] instead, so broken links are not hammered by repeated requests.

use std::error::Error;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use image::{DynamicImage, ImageFormat};
use reqwest::header;
use tracing::Instrument;
use url::Url;

use crate::caching::{LoadOutcome, Loader, LoadingCache};
use crate::config::{Config, ThumbnailConfig};
use crate::responses::{LinkResolverResponse, Payload};
use crate::utils::http::{check_host, is_reserved_host_error};

/// Turns a downloaded image into a thumbnail.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Decodes `data` and re-encodes it so that it fits into `max_size`×`max_size` pixels.
    ///
    /// This is CPU-bound and called on a blocking thread.
    fn make_thumbnail(&self, data: &[u8], max_size: u32) -> anyhow::Result<Vec<u8>>;
}

/// Produces lossless WebP thumbnails with the `image` crate.
///
/// Images are scaled down preserving their aspect ratio; smaller images keep their size.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebpProcessor;

impl ImageProcessor for WebpProcessor {
    fn make_thumbnail(&self, data: &[u8], max_size: u32) -> anyhow::Result<Vec<u8>> {
        let image = image::load_from_memory(data).context("failed to decode image")?;

        let image = if image.width() > max_size || image.height() > max_size {
            image.thumbnail(max_size, max_size)
        } else {
            image
        };

        // The WebP encoder only supports 8-bit RGB(A).
        let image = DynamicImage::ImageRgba8(image.to_rgba8());

        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, ImageFormat::WebP)
            .context("failed to encode thumbnail")?;

        Ok(encoded.into_inner())
    }
}

/// The cache behind `/thumbnail`, keyed by the link.
pub type ThumbnailCache = LoadingCache<ThumbnailLoader>;

/// Downloads images and turns them into [`Payload`]s.
///
/// The context of a load is the span of the request that triggered it.
#[derive(Clone)]
pub struct ThumbnailLoader {
    client: reqwest::Client,
    config: Arc<ThumbnailConfig>,
    allow_reserved: bool,
    processor: Arc<dyn ImageProcessor>,
}

impl fmt::Debug for ThumbnailLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailLoader")
            .field("config", &self.config)
            .field("allow_reserved", &self.allow_reserved)
            .finish()
    }
}

impl ThumbnailLoader {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            config: Arc::new(config.thumbnails.clone()),
            allow_reserved: config.connect_to_reserved_ips,
            processor: Arc::new(WebpProcessor),
        }
    }

    /// Replaces the [`WebpProcessor`].
    pub fn with_processor(mut self, processor: impl ImageProcessor) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    /// Wraps the loader into a cache using the configured default TTL.
    pub fn into_cache(self) -> ThumbnailCache {
        let default_ttl = self.config.default_ttl;
        LoadingCache::new("thumbnail", self, default_ttl)
    }

    fn is_supported(&self, content_type: &str) -> bool {
        let essence = content_type.split(';').next().unwrap_or_default().trim();

        self.config
            .supported_content_types
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(essence))
    }

    async fn fetch_thumbnail(&self, link: &str) -> LoadOutcome<Payload> {
        let no_link_info = || negative(LinkResolverResponse::no_link_info_found());

        let Ok(url) = Url::parse(link) else {
            return negative(LinkResolverResponse::invalid_url());
        };

        if let Err(err) = check_host(&url, self.allow_reserved).await {
            tracing::debug!(%url, error = &err as &dyn Error, "Not fetching thumbnail");
            return no_link_info();
        }

        let mut response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) if is_reserved_host_error(&err) => {
                tracing::debug!(%url, error = &err as &dyn Error, "Not fetching thumbnail");
                return no_link_info();
            }
            Err(err) => {
                tracing::warn!(%url, error = &err as &dyn Error, "Failed to fetch thumbnail");
                return negative(LinkResolverResponse::internal(&err.to_string()));
            }
        };

        let max_content_length = self.config.max_content_length;
        if let Some(content_length) = response.headers().get(header::CONTENT_LENGTH) {
            let content_length = content_length
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok());
            match content_length {
                Some(length) if length > max_content_length => {
                    return negative(LinkResolverResponse::response_too_large());
                }
                Some(_) => {}
                None => {
                    let err = anyhow::anyhow!("invalid Content-Length header from {url}");
                    return LoadOutcome::Failed(err);
                }
            }
        }

        let status = response.status();
        if !(200..=300).contains(&status.as_u16()) {
            tracing::info!(
                url = %response.url(),
                %status,
                "Skipping thumbnail because of the status code",
            );
            return no_link_info();
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !self.is_supported(content_type) {
            tracing::debug!(%url, content_type, "Unsupported thumbnail content type");
            return no_link_info();
        }

        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if (body.len() + chunk.len()) as u64 > max_content_length {
                        return negative(LinkResolverResponse::response_too_large());
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        %url,
                        error = &err as &dyn Error,
                        "Failed to read thumbnail body",
                    );
                    return no_link_info();
                }
            }
        }

        let processor = Arc::clone(&self.processor);
        let max_size = self.config.max_size;
        let thumbnail =
            tokio::task::spawn_blocking(move || processor.make_thumbnail(&body, max_size)).await;

        match thumbnail {
            Ok(Ok(webp)) => {
                LoadOutcome::found(Payload::webp(webp)).with_ttl(self.config.success_ttl)
            }
            Ok(Err(err)) => {
                tracing::info!(%url, error = &*err as &dyn Error, "Could not build thumbnail");
                no_link_info()
            }
            Err(err) => {
                tracing::error!(
                    %url,
                    error = &err as &dyn Error,
                    "Thumbnail processing panicked",
                );
                no_link_info()
            }
        }
    }
}

fn negative(response: LinkResolverResponse) -> LoadOutcome<Payload> {
    LoadOutcome::negative(response.to_payload())
}

impl Loader for ThumbnailLoader {
    type Context = tracing::Span;
    type Value = Payload;

    fn load(
        &self,
        key: &str,
        context: tracing::Span,
    ) -> BoxFuture<'static, LoadOutcome<Payload>> {
        let loader = self.clone();
        let link = key.to_owned();
        async move { loader.fetch_thumbnail(&link).await }
            .instrument(context)
            .boxed()
    }
}
