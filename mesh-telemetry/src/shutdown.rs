//! Ordered teardown of telemetry subsystems
//!
//! Every subsystem that owns a background resource (the tracer provider, the
//! error-reporting client) registers a named teardown callback when it is
//! initialised. At process exit [`ShutdownRegistry::flush`] runs them one
//! after another in registration order, so later teardowns see data already
//! flushed by earlier ones.
//!
//! # Quick Start
//!
//! ```
//! use mesh_telemetry::ShutdownRegistry;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let registry = ShutdownRegistry::new();
//!
//! registry.register("database pool", |_cancel| async {
//!     Ok::<(), std::io::Error>(())
//! });
//!
//! registry.flush(CancellationToken::new()).await.unwrap();
//! # }
//! ```

use crate::error::{BoxError, ShutdownError};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Teardown callback type
///
/// Receives a cancellation token the callback may honour to bound its work.
pub type ShutdownFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// A named teardown callback.
pub struct ShutdownEntry {
    name: String,
    apply: ShutdownFn,
}

impl ShutdownEntry {
    /// Entry name, used in logs and in [`ShutdownError`].
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ShutdownEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered list of teardown callbacks.
///
/// Flushing drains the registry: every entry runs at most once, and a second
/// [`flush`](Self::flush) with nothing registered in between returns `Ok(())`
/// without invoking anything.
#[derive(Debug, Default)]
pub struct ShutdownRegistry {
    entries: Mutex<Vec<ShutdownEntry>>,
}

impl ShutdownRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown callback.
    ///
    /// Safe to call concurrently; entries keep the order in which the
    /// registrations acquired the lock.
    pub fn register<F, Fut, E>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let apply: ShutdownFn = Box::new(move |cancel| {
            let fut = f(cancel);
            Box::pin(async move { fut.await.map_err(Into::into) })
        });

        self.entries.lock().push(ShutdownEntry {
            name: name.into(),
            apply,
        });
    }

    /// Number of entries waiting to be flushed
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Names of the pending entries in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Run every registered teardown sequentially, in registration order.
    ///
    /// A failing teardown does not stop the ones after it; all failures are
    /// returned together.
    pub async fn flush(&self, cancel: CancellationToken) -> Result<(), ShutdownError> {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut failures = ShutdownError::default();

        for entry in entries {
            info!("Flushing buffered {} data", entry.name);

            if let Err(err) = (entry.apply)(cancel.clone()).await {
                error!(step = %entry.name, error = %err, "Shutdown step failed");
                failures.push(entry.name, err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording(
        registry: &ShutdownRegistry,
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) {
        registry.register(name, move |_cancel| async move {
            log.lock().push(name);
            if fail {
                Err(std::io::Error::other(format!("{name} failed")))
            } else {
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_flush_runs_in_registration_order() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        recording(&registry, "first", log.clone(), false);
        recording(&registry, "second", log.clone(), false);
        recording(&registry, "third", log.clone(), false);
        assert_eq!(registry.names(), vec!["first", "second", "third"]);

        registry.flush(CancellationToken::new()).await.unwrap();

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_flush_aggregates_errors_and_keeps_going() {
        let registry = ShutdownRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        recording(&registry, "first", log.clone(), false);
        recording(&registry, "second", log.clone(), true);
        recording(&registry, "third", log.clone(), false);

        let err = registry.flush(CancellationToken::new()).await.unwrap_err();

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(err.len(), 1);
        let (name, cause) = err.failures().next().unwrap();
        assert_eq!(name, "second");
        assert_eq!(cause.to_string(), "second failed");
    }

    #[tokio::test]
    async fn test_flush_drains_registry() {
        let registry = ShutdownRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        registry.register("counter", move |_cancel| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        });

        registry.flush(CancellationToken::new()).await.unwrap();
        registry.flush(CancellationToken::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_flush_passes_cancellation_token() {
        let registry = ShutdownRegistry::new();
        let seen = Arc::new(Mutex::new(None));

        let slot = seen.clone();
        registry.register("observer", move |cancel: CancellationToken| async move {
            *slot.lock() = Some(cancel.is_cancelled());
            Ok::<(), BoxError>(())
        });

        let token = CancellationToken::new();
        token.cancel();
        registry.flush(token).await.unwrap();

        assert_eq!(*seen.lock(), Some(true));
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = Arc::new(ShutdownRegistry::new());

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(format!("subsystem-{i}"), |_cancel| async {
                    Ok::<(), BoxError>(())
                });
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 16);
        registry.flush(CancellationToken::new()).await.unwrap();
    }
}
