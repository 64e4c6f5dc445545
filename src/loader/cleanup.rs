//! Run-at-most-once teardown actions attached to load results.
//!
//! A `CleanupAction` is cheap to clone; every clone shares one slot, so the
//! wrapped routine runs exactly once no matter how many holders call `run`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::HubError;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, crate::Result<()>> + Send>;

struct CleanupInner {
    label: String,
    action: Mutex<Option<CleanupFn>>,
    ran: AtomicBool,
}

/// Idempotent async teardown routine.
#[derive(Clone)]
pub struct CleanupAction {
    inner: Arc<CleanupInner>,
}

impl CleanupAction {
    /// Wrap a teardown routine. `label` identifies it in logs and errors.
    pub fn new<F, Fut>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || action().boxed());
        Self {
            inner: Arc::new(CleanupInner {
                label: label.into(),
                action: Mutex::new(Some(boxed)),
                ran: AtomicBool::new(false),
            }),
        }
    }

    /// Combine several actions into one that runs them all concurrently.
    ///
    /// Every member runs even if others fail; failures are joined into a
    /// single `HubError::Cleanup`.
    pub fn combine(label: impl Into<String>, actions: Vec<CleanupAction>) -> Self {
        let label = label.into();
        let error_label = label.clone();
        Self::new(label, move || async move {
            let results = futures::future::join_all(actions.iter().map(|a| a.run())).await;
            let failures: Vec<String> = results
                .into_iter()
                .filter_map(|r| r.err().map(|e| e.to_string()))
                .collect();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(HubError::Cleanup(error_label, failures.join("; ")))
            }
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the routine has already been taken for execution.
    pub fn has_run(&self) -> bool {
        self.inner.ran.load(Ordering::SeqCst)
    }

    /// Run the routine. Calls after the first are no-ops returning `Ok(())`.
    pub async fn run(&self) -> crate::Result<()> {
        let action = self
            .inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match action {
            Some(action) => {
                self.inner.ran.store(true, Ordering::SeqCst);
                tracing::debug!(cleanup = %self.inner.label, "running cleanup action");
                action().await
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("label", &self.inner.label)
            .field("ran", &self.has_run())
            .finish()
    }
}
