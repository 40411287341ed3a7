use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio::time::{self, Duration};

use super::*;

/// A [`Loader`] that counts its invocations and defers to a closure.
///
/// The closure receives the key and the 1-based number of the invocation.
type LoadFn = Box<dyn Fn(String, usize) -> BoxFuture<'static, LoadOutcome<String>> + Send + Sync>;

struct TestLoader {
    calls: Arc<AtomicUsize>,
    f: LoadFn,
}

impl Loader for TestLoader {
    type Context = ();
    type Value = String;

    fn load(&self, key: &str, _context: ()) -> BoxFuture<'static, LoadOutcome<String>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        (self.f)(key.to_owned(), call)
    }
}

fn test_cache<F>(default_ttl: Duration, f: F) -> (LoadingCache<TestLoader>, Arc<AtomicUsize>)
where
    F: Fn(String, usize) -> BoxFuture<'static, LoadOutcome<String>> + Send + Sync + 'static,
{
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = TestLoader {
        calls: Arc::clone(&calls),
        f: Box::new(f),
    };
    (LoadingCache::new("test", loader, default_ttl), calls)
}

const TEN_MINUTES: Duration = Duration::from_secs(600);

#[tokio::test]
async fn test_coalescing() {
    time::pause();

    let (cache, calls) = test_cache(TEN_MINUTES, |key, call| {
        async move {
            time::sleep(Duration::from_millis(100)).await;
            LoadOutcome::found(format!("{key}:{call}"))
        }
        .boxed()
    });

    let results = futures::future::join_all((0..10).map(|_| cache.get("key", ()))).await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    for result in results {
        assert_eq!(result.unwrap(), "key:1");
    }
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_expiry() {
    time::pause();

    let (cache, calls) = test_cache(TEN_MINUTES, |key, call| {
        async move { LoadOutcome::found(format!("{key}:{call}")) }.boxed()
    });

    let url = "http://example.com/img.png";
    assert_eq!(cache.get(url, ()).await.unwrap(), format!("{url}:1"));
    assert_eq!(cache.get(url, ()).await.unwrap(), format!("{url}:1"));

    time::advance(Duration::from_secs(9 * 60)).await;
    assert_eq!(cache.get(url, ()).await.unwrap(), format!("{url}:1"));
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    time::advance(Duration::from_secs(61)).await;
    let res = futures::join!(cache.get(url, ()), cache.get(url, ()));
    assert_eq!(res.0.unwrap(), format!("{url}:2"));
    assert_eq!(res.1.unwrap(), format!("{url}:2"));
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_ttl_override() {
    time::pause();

    let (cache, calls) = test_cache(Duration::from_secs(60), |key, call| {
        async move {
            let value = format!("{key}:{call}");
            if key == "long" {
                LoadOutcome::found(value).with_ttl(TEN_MINUTES)
            } else {
                LoadOutcome::negative(value)
            }
        }
        .boxed()
    });

    assert_eq!(cache.get("long", ()).await.unwrap(), "long:1");
    assert_eq!(cache.get("short", ()).await.unwrap(), "short:2");

    // Just before the default TTL runs out, both are cached.
    time::advance(Duration::from_secs(59)).await;
    assert_eq!(cache.get("long", ()).await.unwrap(), "long:1");
    assert_eq!(cache.get("short", ()).await.unwrap(), "short:2");

    // The default TTL has run out, the override has not.
    time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get("long", ()).await.unwrap(), "long:1");
    assert_eq!(cache.get("short", ()).await.unwrap(), "short:3");

    time::advance(Duration::from_secs(600 - 60 - 1)).await;
    assert_eq!(cache.get("long", ()).await.unwrap(), "long:1");

    time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get("long", ()).await.unwrap(), "long:4");
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[tokio::test]
async fn test_zero_ttl() {
    time::pause();

    let (cache, calls) = test_cache(Duration::ZERO, |key, call| {
        async move {
            time::sleep(Duration::from_millis(10)).await;
            LoadOutcome::found(format!("{key}:{call}"))
        }
        .boxed()
    });

    let res = futures::join!(cache.get("key", ()), cache.get("key", ()));
    assert_eq!(res.0.unwrap(), "key:1");
    assert_eq!(res.1.unwrap(), "key:1");

    assert_eq!(cache.get("key", ()).await.unwrap(), "key:2");
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_independent_keys() {
    let release = Arc::new(Notify::new());

    let (cache, _calls) = {
        let release = Arc::clone(&release);
        test_cache(
            TEN_MINUTES,
            move |key: String, _call: usize| -> BoxFuture<'static, LoadOutcome<String>> {
                let release = Arc::clone(&release);
                async move {
                    if key == "slow" {
                        release.notified().await;
                    }
                    LoadOutcome::found(key)
                }
                .boxed()
            },
        )
    };

    let slow = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("slow", ()).await }
    });
    tokio::task::yield_now().await;

    assert_eq!(cache.get("fast", ()).await.unwrap(), "fast");
    assert!(!slow.is_finished());

    release.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), "slow");
}

#[tokio::test]
async fn test_negative_values_are_cached() {
    let (cache, calls) = test_cache(TEN_MINUTES, |_key, _call| {
        async move { LoadOutcome::negative("no link info found".to_owned()) }.boxed()
    });

    assert_eq!(
        cache.get("http://bad.host", ()).await.unwrap(),
        "no link info found"
    );
    assert_eq!(
        cache.get("http://bad.host", ()).await.unwrap(),
        "no link info found"
    );
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    time::pause();

    let (cache, calls) = test_cache(TEN_MINUTES, |key, call| {
        async move {
            time::sleep(Duration::from_millis(10)).await;
            if call == 1 {
                LoadOutcome::Failed(anyhow::anyhow!("upstream exploded"))
            } else {
                LoadOutcome::found(key)
            }
        }
        .boxed()
    });

    let res = futures::join!(cache.get("key", ()), cache.get("key", ()));
    let expected = Err(LoadError::Failed("upstream exploded".into()));
    assert_eq!(res.0, expected);
    assert_eq!(res.1, expected);
    assert!(cache.is_empty());

    assert_eq!(cache.get("key", ()).await.unwrap(), "key");
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_panicking_loader() {
    let (cache, calls) = test_cache(TEN_MINUTES, |key, call| {
        async move {
            tokio::task::yield_now().await;
            if call == 1 {
                panic!("loader panicked");
            }
            LoadOutcome::found(key)
        }
        .boxed()
    });

    let res = futures::join!(cache.get("key", ()), cache.get("key", ()));
    assert_eq!(res.0, Err(LoadError::Aborted));
    assert_eq!(res.1, Err(LoadError::Aborted));
    assert!(cache.is_empty());

    assert_eq!(cache.get("key", ()).await.unwrap(), "key");
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_dropped_caller_keeps_computation() {
    time::pause();

    let (cache, calls) = test_cache(TEN_MINUTES, |key, _call| {
        async move {
            time::sleep(Duration::from_secs(10)).await;
            LoadOutcome::found(key)
        }
        .boxed()
    });

    let timed_out = time::timeout(Duration::from_secs(1), cache.get("key", ())).await;
    assert!(timed_out.is_err());
    assert_eq!(cache.len(), 1);

    assert_eq!(cache.get("key", ()).await.unwrap(), "key");
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn test_outcome_ttl() {
    let outcome = LoadOutcome::found(1).with_ttl(TEN_MINUTES);
    assert_eq!(outcome.ttl(), Some(TEN_MINUTES));
    assert_eq!(outcome.value(), Some(&1));

    let outcome = LoadOutcome::negative(2);
    assert_eq!(outcome.ttl(), None);

    let outcome = LoadOutcome::<u32>::Failed(anyhow::anyhow!("nope")).with_ttl(TEN_MINUTES);
    assert_eq!(outcome.ttl(), None);
    assert_eq!(outcome.value(), None);
}
