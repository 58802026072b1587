//! Progress-callback trait for per-record batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchConfigBuilder::progress_callback`] to receive
//! events as the orchestrator drives each record.
//!
//! Callers can forward events to a channel, a log, or a terminal progress
//! bar without the library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use certmail::{BatchProgressCallback, BatchConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     delivered: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_record_complete(&self, index: usize, total: usize, record_id: &str) {
//!         let done = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{record_id} delivered ({done}, record {}/{total})", index + 1);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     delivered: AtomicUsize::new(0),
//! });
//!
//! let config = BatchConfig::builder()
//!     .progress_callback(counter as Arc<dyn BatchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::report::Stage;
use std::sync::Arc;

/// Called by the orchestrator as it processes each record.
///
/// With `concurrency > 1` the per-record methods are called concurrently
/// from different tasks, so implementations must synchronise shared state
/// (`Mutex`, `AtomicUsize`). All methods default to no-ops.
///
/// `index` is the 0-based position of the record in the batch.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once after extraction, before any record starts.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a record enters the render stage.
    fn on_record_start(&self, index: usize, total: usize, record_id: &str) {
        let _ = (index, total, record_id);
    }

    /// Called when a record has been delivered.
    fn on_record_complete(&self, index: usize, total: usize, record_id: &str) {
        let _ = (index, total, record_id);
    }

    /// Called when a record fails.
    ///
    /// * `stage` is where it stopped
    /// * `error` is the same text stored in the report
    fn on_record_error(&self, index: usize, total: usize, record_id: &str, stage: Stage, error: &str) {
        let _ = (index, total, record_id, stage, error);
    }

    /// Called for each record skipped because the batch was cancelled.
    fn on_record_cancelled(&self, index: usize, total: usize, record_id: &str) {
        let _ = (index, total, record_id);
    }

    /// Called once after every record has reached a terminal state.
    fn on_batch_complete(&self, total: usize, delivered: usize) {
        let _ = (total, delivered);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        cancelled: AtomicUsize,
        error_stages: Mutex<Vec<Stage>>,
        delivered_total: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_record_start(&self, _index: usize, _total: usize, _record_id: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_record_complete(&self, _index: usize, _total: usize, _record_id: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_record_error(&self, _index: usize, _total: usize, _record_id: &str, stage: Stage, _error: &str) {
            self.error_stages.lock().unwrap().push(stage);
        }

        fn on_record_cancelled(&self, _index: usize, _total: usize, _record_id: &str) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _total: usize, delivered: usize) {
            self.delivered_total.store(delivered, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(3);
        cb.on_record_start(0, 3, "Ada");
        cb.on_record_complete(0, 3, "Ada");
        cb.on_record_error(1, 3, "Bob", Stage::Convert, "boom");
        cb.on_record_cancelled(2, 3, "Cy");
        cb.on_batch_complete(3, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_record_start(0, 3, "Ada");
        tracker.on_record_complete(0, 3, "Ada");
        tracker.on_record_start(1, 3, "Bob");
        tracker.on_record_error(1, 3, "Bob", Stage::Deliver, "rejected");
        tracker.on_record_cancelled(2, 3, "Cy");
        tracker.on_batch_complete(3, 1);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.error_stages.lock().unwrap(), vec![Stage::Deliver]);
        assert_eq!(tracker.delivered_total.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_record_start(0, 10, "Ada");
    }
}
