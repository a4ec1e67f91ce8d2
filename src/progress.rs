//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as pages move through the pipeline.
//!
//! All events are delivered from the orchestrator's bookkeeping task, one at
//! a time and in the order the orchestrator observed them, so implementations
//! never see two calls at once. The trait is still `Send + Sync` because that
//! task may run on any runtime worker thread.
//!
//! # Example
//!
//! ```rust
//! use scan2pdf::{PipelineProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     scanned: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_page_scanned(&self, index: usize) {
//!         self.scanned.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("scanned page {index}");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { scanned: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::job::JobReport;
use std::sync::Arc;

/// Called by the orchestrator as pages change state.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Page indices are 1-based scan order.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once, before the first frame is requested from the scanner.
    fn on_job_start(&self) {}

    /// A frame came out of the feeder.
    fn on_page_scanned(&self, index: usize) {
        let _ = index;
    }

    /// The page was classified blank and will not appear in the PDF.
    ///
    /// `density` is the dark-pixel fraction that triggered the decision.
    fn on_page_excluded(&self, index: usize, density: f32) {
        let _ = (index, density);
    }

    /// The page has its text layer and has been added to the PDF.
    fn on_page_ready(&self, index: usize, words: usize) {
        let _ = (index, words);
    }

    /// Classification or OCR failed for the page.
    fn on_page_failed(&self, index: usize, error: &str) {
        let _ = (index, error);
    }

    /// Called once after every page has settled and the outcome is known.
    fn on_job_complete(&self, report: &JobReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        scanned: AtomicUsize,
        excluded: Mutex<Vec<usize>>,
        ready_words: AtomicUsize,
        failed: Mutex<Vec<(usize, String)>>,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_page_scanned(&self, _index: usize) {
            self.scanned.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_excluded(&self, index: usize, _density: f32) {
            self.excluded.lock().unwrap().push(index);
        }

        fn on_page_ready(&self, _index: usize, words: usize) {
            self.ready_words.fetch_add(words, Ordering::SeqCst);
        }

        fn on_page_failed(&self, index: usize, error: &str) {
            self.failed.lock().unwrap().push((index, error.to_string()));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_job_start();
        cb.on_page_scanned(1);
        cb.on_page_excluded(2, 0.0001);
        cb.on_page_ready(1, 120);
        cb.on_page_failed(3, "tesseract crashed");
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_page_scanned(1);
        tracker.on_page_scanned(2);
        tracker.on_page_scanned(3);
        tracker.on_page_ready(1, 40);
        tracker.on_page_excluded(2, 0.0);
        tracker.on_page_failed(3, "timeout");
        tracker.on_page_ready(3, 2);

        assert_eq!(tracker.scanned.load(Ordering::SeqCst), 3);
        assert_eq!(*tracker.excluded.lock().unwrap(), vec![2]);
        assert_eq!(tracker.ready_words.load(Ordering::SeqCst), 42);
        assert_eq!(tracker.failed.lock().unwrap()[0].1, "timeout");
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn PipelineProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_job_start();
        cb.on_page_scanned(1);
    }
}
