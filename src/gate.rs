//! Named exclusive-access resources.
//!
//! A typical document converter (LibreOffice, a COM automation server, a
//! native library with global state) is a single process-wide engine that
//! corrupts output when two conversions run at once. Rather than hiding a
//! lock inside the conversion stage, the engine is modelled as a named
//! [`ExclusiveResource`] that callers acquire around each call, so the
//! serialisation point is visible in the orchestrator and in the logs.
//!
//! [`conversion_engine`] returns the process-wide instance shared by every
//! batch running in this process.

use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

static CONVERSION_ENGINE: Lazy<Arc<ExclusiveResource>> =
    Lazy::new(|| Arc::new(ExclusiveResource::new("conversion-engine")));

/// The process-wide gate for non-reentrant converters.
pub fn conversion_engine() -> Arc<ExclusiveResource> {
    Arc::clone(&CONVERSION_ENGINE)
}

/// A resource at most one task may hold at a time.
#[derive(Debug)]
pub struct ExclusiveResource {
    name: &'static str,
    lock: Mutex<()>,
}

impl ExclusiveResource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for exclusive access. Access ends when the guard is dropped.
    ///
    /// Waiters are served in FIFO order (tokio's mutex is fair).
    pub async fn acquire(&self) -> ResourceGuard<'_> {
        trace!(resource = self.name, "waiting");
        let guard = self.lock.lock().await;
        trace!(resource = self.name, "acquired");
        ResourceGuard {
            name: self.name,
            _guard: guard,
        }
    }
}

/// Proof of exclusive access to an [`ExclusiveResource`].
#[derive(Debug)]
pub struct ResourceGuard<'a> {
    name: &'static str,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        trace!(resource = self.name, "released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn process_wide_gate_is_shared() {
        let a = conversion_engine();
        let b = conversion_engine();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "conversion-engine");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn holders_never_overlap() {
        let gate = Arc::new(ExclusiveResource::new("test-engine"));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _g = gate.acquire().await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
