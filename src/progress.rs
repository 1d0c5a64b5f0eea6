//! Fire-and-forget progress reporting
//!
//! Progress is an integer percentage: 0-50 covers the deobfuscation
//! pipeline, 50-100 file processing, and 100-200 the optional full
//! health check. Reporting never blocks the pipeline; duplicate values are
//! suppressed so sinks see a monotone stream of changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Callback receiving integer progress percentages
pub type ProgressSink = Arc<dyn Fn(u32) + Send + Sync>;

/// Deduplicating wrapper around a progress sink
#[derive(Clone)]
pub struct ProgressReporter {
    sink: ProgressSink,
    last: Arc<AtomicU32>,
}

impl ProgressReporter {
    /// Wrap a sink callback
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            sink,
            last: Arc::new(AtomicU32::new(u32::MAX)),
        }
    }

    /// A reporter that drops everything
    pub fn disabled() -> Self {
        Self::new(Arc::new(|_| {}))
    }

    /// Report an absolute percentage; repeated values are dropped
    pub fn report(&self, percent: u32) {
        if self.last.swap(percent, Ordering::Relaxed) != percent {
            (self.sink)(percent);
        }
    }

    /// Report progress of `done` out of `total` scaled into `[from, to]`
    pub fn report_span(&self, from: u32, to: u32, done: usize, total: usize) {
        if total == 0 {
            self.report(to);
            return;
        }
        let width = to.saturating_sub(from) as usize;
        let scaled = from + ((done.min(total) * width) / total) as u32;
        self.report(scaled);
    }
}
