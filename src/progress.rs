//! Progress reporting and cancellation for long-running imports
//!
//! Progress is a single 0-100 value that never goes backwards. Each pipeline
//! phase (and each record kind inside the fetch phase) gets a sub-range, so a
//! component can always report its own 0-100 without knowing where it sits in
//! the whole run.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type ProgressCallback = Box<dyn FnMut(u8) + Send>;

struct Inner {
    callback: Option<ProgressCallback>,
    last: u8,
}

/// Monotonic 0-100 progress sink shared by every phase of one run
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Mutex<Inner>>,
}

impl ProgressReporter {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(u8) + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                callback: Some(Box::new(callback)),
                last: 0,
            })),
        }
    }

    /// A reporter that only tracks the value
    pub fn silent() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                callback: None,
                last: 0,
            })),
        }
    }

    /// Report an overall percentage. Values below the last report are clamped up.
    pub fn report(&self, percent: u8) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let value = percent.min(100).max(inner.last);
        if value == inner.last && value != 0 {
            return;
        }
        inner.last = value;
        if let Some(callback) = inner.callback.as_mut() {
            callback(value);
        }
    }

    /// Last value reported
    pub fn current(&self) -> u8 {
        self.inner.lock().map(|inner| inner.last).unwrap_or(0)
    }

    /// The whole 0-100 range of this reporter
    pub fn range(&self, start: u8, end: u8) -> ProgressRange {
        ProgressRange {
            reporter: self.clone(),
            start: start as f64,
            end: end.max(start) as f64,
        }
    }
}

/// A slice of the overall progress owned by one phase
#[derive(Clone)]
pub struct ProgressRange {
    reporter: ProgressReporter,
    start: f64,
    end: f64,
}

impl ProgressRange {
    /// Report progress within this range, 0-100
    pub fn report(&self, percent: f64) {
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        let overall = self.start + (self.end - self.start) * fraction;
        self.reporter.report(overall.floor() as u8);
    }

    pub fn complete(&self) {
        self.report(100.0);
    }

    /// Nest a range covering `start_pct..end_pct` of this one
    pub fn sub(&self, start_pct: f64, end_pct: f64) -> ProgressRange {
        let width = self.end - self.start;
        let start = self.start + width * (start_pct / 100.0).clamp(0.0, 1.0);
        let end = self.start + width * (end_pct / 100.0).clamp(0.0, 1.0);
        debug!("Progress sub-range {:.1}..{:.1}", start, end);
        ProgressRange {
            reporter: self.reporter.clone(),
            start,
            end: end.max(start),
        }
    }
}

/// Cooperative cancellation flag checked between page fetches
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
