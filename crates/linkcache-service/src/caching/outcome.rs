use std::time::Duration;

use thiserror::Error;

/// What a single [`Loader::load`](super::Loader::load) invocation produced.
#[derive(Debug)]
pub enum LoadOutcome<V> {
    /// The value that was asked for.
    Found {
        value: V,
        /// Overrides the cache's default time-to-live for this value.
        ttl: Option<Duration>,
    },
    /// A well-formed "there is nothing here" answer.
    ///
    /// Negative values are cached and handed out exactly like found ones; callers cannot tell
    /// them apart.
    Negative {
        value: V,
        /// Overrides the cache's default time-to-live for this value.
        ttl: Option<Duration>,
    },
    /// An unexpected failure.
    ///
    /// Nothing is cached and every caller waiting on this computation receives
    /// [`LoadError::Failed`]. The next request for the key starts a fresh computation.
    Failed(anyhow::Error),
}

impl<V> LoadOutcome<V> {
    /// A found value, cached for the default time-to-live.
    pub fn found(value: V) -> Self {
        Self::Found { value, ttl: None }
    }

    /// A negative value, cached for the default time-to-live.
    pub fn negative(value: V) -> Self {
        Self::Negative { value, ttl: None }
    }

    /// Overrides the time-to-live of a found or negative value.
    pub fn with_ttl(self, ttl: Duration) -> Self {
        match self {
            Self::Found { value, .. } => Self::Found {
                value,
                ttl: Some(ttl),
            },
            Self::Negative { value, .. } => Self::Negative {
                value,
                ttl: Some(ttl),
            },
            Self::Failed(err) => Self::Failed(err),
        }
    }

    /// The cached value, if there is one.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Found { value, .. } | Self::Negative { value, .. } => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// The requested time-to-live override, if any.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Found { ttl, .. } | Self::Negative { ttl, .. } => *ttl,
            Self::Failed(_) => None,
        }
    }

    /// Tag value for metrics.
    pub(super) fn status(&self) -> &'static str {
        match self {
            Self::Found { .. } => "found",
            Self::Negative { .. } => "negative",
            Self::Failed(_) => "failed",
        }
    }
}

/// The error returned by [`LoadingCache::get`](super::LoadingCache::get).
///
/// Neither variant is ever cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The loader reported a [`LoadOutcome::Failed`].
    #[error("loading failed: {0}")]
    Failed(String),
    /// The computation ended without producing an outcome, because the loader panicked or its
    /// task was torn down.
    #[error("computation was aborted")]
    Aborted,
}
