//! Tables that are periodically rebuilt from an external source.
//!
//! A [`RefreshTable`] holds a complete snapshot of some remote mapping. The first snapshot is
//! fetched before the table is handed out, afterwards a [`RefreshTask`] replaces it on a fixed
//! interval. Readers always see a complete snapshot: either the old one or the new one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::task::JoinHandle;

/// Where a [`RefreshTable`] gets its contents from.
pub trait TableSource: Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    /// Fetches the complete table.
    fn fetch(&self) -> BoxFuture<'static, anyhow::Result<HashMap<String, Self::Record>>>;

    /// Post-processes a freshly fetched table before it becomes visible to readers.
    fn augment(&self, _table: &mut HashMap<String, Self::Record>) {}
}

type Snapshot<R> = Arc<HashMap<String, R>>;

struct TableInner<S: TableSource> {
    name: String,
    source: S,
    snapshot: Mutex<Snapshot<S::Record>>,
}

impl<S: TableSource> TableInner<S> {
    async fn refresh(&self) -> anyhow::Result<()> {
        let start = Instant::now();

        let mut table = self
            .source
            .fetch()
            .await
            .with_context(|| format!("failed to refresh {}", self.name))?;
        self.source.augment(&mut table);
        let entries = table.len();

        let previous = {
            let mut snapshot = self.snapshot.lock().unwrap();
            std::mem::replace(&mut *snapshot, Arc::new(table))
        };
        drop(previous);

        metric!(counter("refresh.success") += 1, "table" => &self.name);
        metric!(gauge("refresh.entries") = entries as u64, "table" => &self.name);
        metric!(timer("refresh.duration") = start.elapsed(), "table" => &self.name);
        tracing::info!(table = %self.name, entries, "Refreshed table");

        Ok(())
    }
}

/// A complete in-memory copy of a [`TableSource`].
///
/// Cloning the table is cheap and every clone shares the same snapshot.
pub struct RefreshTable<S: TableSource> {
    inner: Arc<TableInner<S>>,
}

impl<S: TableSource> Clone for RefreshTable<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TableSource> fmt::Debug for RefreshTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTable")
            .field("name", &self.inner.name)
            .field("entries", &self.len())
            .finish()
    }
}

impl<S: TableSource> RefreshTable<S> {
    /// Fetches the initial table and starts refreshing it every `interval`.
    ///
    /// Only returns once the initial table is installed. An error fetching it is returned, errors
    /// of later refreshes end the returned [`RefreshTask`].
    pub async fn start(
        name: impl Into<String>,
        source: S,
        interval: Duration,
    ) -> anyhow::Result<(Self, RefreshTask)> {
        let inner = Arc::new(TableInner {
            name: name.into(),
            source,
            snapshot: Mutex::new(Arc::new(HashMap::new())),
        });
        inner.refresh().await?;

        let task_inner = Arc::clone(&inner);
        let refresh_loop = async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = task_inner.refresh().await {
                    tracing::error!(
                        table = %task_inner.name,
                        error = &*err as &dyn std::error::Error,
                        "Refreshing table failed",
                    );
                    return Err(err);
                }
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        let task = RefreshTask {
            name: inner.name.clone(),
            handle: Some(tokio::spawn(refresh_loop)),
        };

        Ok((Self { inner }, task))
    }

    /// Looks up the record with the given ID in the current snapshot.
    pub fn get(&self, id: &str) -> Option<S::Record> {
        self.inner.snapshot.lock().unwrap().get(id).cloned()
    }

    /// The complete current snapshot.
    ///
    /// It is not affected by later refreshes.
    pub fn snapshot(&self) -> Snapshot<S::Record> {
        Arc::clone(&self.inner.snapshot.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refreshes the table right away, independently of the periodic refreshes.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        self.inner.refresh().await
    }
}

/// Handle to the task periodically refreshing a [`RefreshTable`].
///
/// The task is aborted when this handle is dropped.
pub struct RefreshTask {
    name: String,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl fmt::Debug for RefreshTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTask")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl RefreshTask {
    /// Waits for the refresh task to end.
    ///
    /// The task only ends when a refresh fails, so this resolves to that error. Once it resolved,
    /// further calls never complete.
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return futures::future::pending().await;
        };

        let result = handle.await;
        self.handle = None;

        match result {
            Ok(result) => result,
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("refresh task of {} panicked", self.name))),
        }
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
