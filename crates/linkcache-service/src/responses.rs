//! Bodies written by the link resolver endpoints.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::utils::http::escape_html;

const WEBP: &str = "image/webp";
const JSON: &str = "application/json";

/// A ready-to-send response body, as stored in the thumbnail cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub content_type: &'static str,
    pub body: Bytes,
}

impl Payload {
    pub fn webp(body: impl Into<Bytes>) -> Self {
        Self {
            content_type: WEBP,
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            content_type: JSON,
            body: body.into(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.content_type == JSON
    }
}

/// The JSON answer when no thumbnail could be made.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResolverResponse {
    pub status: u16,
    pub message: String,
}

impl LinkResolverResponse {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_url() -> Self {
        Self::new(500, "Could not fetch link info: Invalid URL")
    }

    pub fn no_link_info_found() -> Self {
        Self::new(404, "Could not fetch link info: No link info found")
    }

    pub fn response_too_large() -> Self {
        Self::new(500, "Could not fetch link info: Response too large (>5mb)")
    }

    /// An unexpected upstream error. The message is HTML-escaped since it may echo the URL.
    pub fn internal(message: &str) -> Self {
        Self::new(500, escape_html(message))
    }

    pub fn to_payload(&self) -> Payload {
        // Serializing two plain fields cannot fail.
        let body = serde_json::to_vec(self).unwrap_or_default();
        Payload::json(body)
    }
}
