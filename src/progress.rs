//! Progress reporting for bundle and unbundle operations.
//!
//! Progress callbacks are only ever invoked from the thread that drives the
//! operation (the part consumer loop when bundling, the final copy when
//! unbundling), never from stage threads. Reporters therefore need `Send`
//! but not `Sync`.
//!
//! # Example
//!
//! ```rust
//! use imgbundle::progress::{ProgressReporter, StatisticsProgress};
//!
//! let mut progress = StatisticsProgress::new();
//! progress.on_total(Some(2048));
//! progress.on_progress(1024, Some(2048));
//! assert_eq!(progress.state().percentage(), 50.0);
//! ```

use std::time::{Duration, Instant};

const BYTES_KB: f64 = 1024.0;
const BYTES_MB: f64 = BYTES_KB * 1024.0;
const BYTES_GB: f64 = BYTES_MB * 1024.0;

/// Progress callbacks for bundle and unbundle operations.
///
/// Every method has a no-op default.
pub trait ProgressReporter: Send {
    /// Called once before copying starts, with the expected byte count when
    /// one is known.
    fn on_total(&mut self, total_bytes: Option<u64>) {
        let _ = total_bytes;
    }

    /// Called after each chunk is written.
    fn on_progress(&mut self, bytes_processed: u64, total_bytes: Option<u64>) {
        let _ = (bytes_processed, total_bytes);
    }

    /// Called when a bundle part has been written and handed off.
    fn on_part(&mut self, index: u32, size: u64) {
        let _ = (index, size);
    }

    /// Called for non-fatal conditions worth surfacing to a user.
    fn on_warning(&mut self, message: &str) {
        let _ = message;
    }

    /// Called once the operation finishes successfully.
    fn on_complete(&mut self, bytes_processed: u64) {
        let _ = bytes_processed;
    }
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for Box<P> {
    fn on_total(&mut self, total_bytes: Option<u64>) {
        (**self).on_total(total_bytes);
    }

    fn on_progress(&mut self, bytes_processed: u64, total_bytes: Option<u64>) {
        (**self).on_progress(bytes_processed, total_bytes);
    }

    fn on_part(&mut self, index: u32, size: u64) {
        (**self).on_part(index, size);
    }

    fn on_warning(&mut self, message: &str) {
        (**self).on_warning(message);
    }

    fn on_complete(&mut self, bytes_processed: u64) {
        (**self).on_complete(bytes_processed);
    }
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for &mut P {
    fn on_total(&mut self, total_bytes: Option<u64>) {
        (**self).on_total(total_bytes);
    }

    fn on_progress(&mut self, bytes_processed: u64, total_bytes: Option<u64>) {
        (**self).on_progress(bytes_processed, total_bytes);
    }

    fn on_part(&mut self, index: u32, size: u64) {
        (**self).on_part(index, size);
    }

    fn on_warning(&mut self, message: &str) {
        (**self).on_warning(message);
    }

    fn on_complete(&mut self, bytes_processed: u64) {
        (**self).on_complete(bytes_processed);
    }
}

/// A progress reporter that does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// Adapts a closure receiving `(bytes_processed, total_bytes)`.
pub struct ProgressFn<F>(F);

/// Creates a reporter that forwards byte progress to `f`.
///
/// ```rust
/// use imgbundle::progress::{progress_fn, ProgressReporter};
///
/// let mut last = 0;
/// let mut reporter = progress_fn(move |done, _total| last = done);
/// reporter.on_progress(10, None);
/// ```
pub fn progress_fn<F>(f: F) -> ProgressFn<F>
where
    F: FnMut(u64, Option<u64>) + Send,
{
    ProgressFn(f)
}

impl<F> ProgressReporter for ProgressFn<F>
where
    F: FnMut(u64, Option<u64>) + Send,
{
    fn on_progress(&mut self, bytes_processed: u64, total_bytes: Option<u64>) {
        (self.0)(bytes_processed, total_bytes);
    }
}

/// Progress state with timing and rate calculation.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Expected total, if known.
    pub total_bytes: Option<u64>,
    /// Bytes processed so far.
    pub processed_bytes: u64,
    /// Parts handed off so far.
    pub parts: usize,
    /// Warnings received.
    pub warnings: Vec<String>,
    /// Processing start time.
    pub start_time: Instant,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            total_bytes: None,
            processed_bytes: 0,
            parts: 0,
            warnings: Vec::new(),
            start_time: Instant::now(),
        }
    }
}

impl ProgressState {
    /// Creates a new progress state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the completion percentage (0.0 - 100.0), or 0 when the total
    /// is unknown or zero.
    pub fn percentage(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.processed_bytes as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Returns elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// A reporter that records statistics.
#[derive(Debug, Default)]
pub struct StatisticsProgress {
    state: ProgressState,
    finished: bool,
}

impl StatisticsProgress {
    /// Creates a new statistics reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded state.
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Returns `true` once [`ProgressReporter::on_complete`] was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl ProgressReporter for StatisticsProgress {
    fn on_total(&mut self, total_bytes: Option<u64>) {
        self.state.total_bytes = total_bytes;
    }

    fn on_progress(&mut self, bytes_processed: u64, _total_bytes: Option<u64>) {
        self.state.processed_bytes = bytes_processed;
    }

    fn on_part(&mut self, _index: u32, _size: u64) {
        self.state.parts += 1;
    }

    fn on_warning(&mut self, message: &str) {
        self.state.warnings.push(message.to_string());
    }

    fn on_complete(&mut self, bytes_processed: u64) {
        self.state.processed_bytes = bytes_processed;
        self.finished = true;
    }
}

/// Byte distance between forwarded progress updates used by [`Unbundler`](crate::Unbundler).
pub const DEFAULT_PROGRESS_STEP: u64 = 1024 * 1024;

/// Forwards byte progress at most once per `step` bytes.
///
/// The copy loop reports after every chunk, which at the default chunk size
/// is thousands of callbacks per second. The update that reaches the total
/// is always forwarded. Part, warning, and completion callbacks pass
/// through untouched.
///
/// ```rust
/// use imgbundle::progress::{ProgressReporter, StatisticsProgress, ThrottledProgress};
///
/// let mut progress = ThrottledProgress::new(StatisticsProgress::new(), 100);
/// progress.on_progress(40, Some(250));
/// progress.on_progress(120, Some(250));
/// progress.on_progress(160, Some(250));
/// assert_eq!(progress.inner().state().processed_bytes, 120);
/// progress.on_progress(250, Some(250));
/// assert_eq!(progress.inner().state().processed_bytes, 250);
/// ```
#[derive(Debug)]
pub struct ThrottledProgress<P> {
    inner: P,
    step: u64,
    forwarded: u64,
}

impl<P: ProgressReporter> ThrottledProgress<P> {
    /// Wraps `inner`, forwarding an update once `step` more bytes have
    /// been processed since the last one.
    pub fn new(inner: P, step: u64) -> Self {
        Self {
            inner,
            step: step.max(1),
            forwarded: 0,
        }
    }

    /// Returns the wrapped reporter.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Unwraps the reporter.
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: ProgressReporter> ProgressReporter for ThrottledProgress<P> {
    fn on_total(&mut self, total_bytes: Option<u64>) {
        self.forwarded = 0;
        self.inner.on_total(total_bytes);
    }

    fn on_progress(&mut self, bytes_processed: u64, total_bytes: Option<u64>) {
        let stepped = bytes_processed >= self.forwarded.saturating_add(self.step);
        let reached = total_bytes.is_some_and(|total| bytes_processed >= total);
        if stepped || (reached && bytes_processed > self.forwarded) {
            self.forwarded = bytes_processed;
            self.inner.on_progress(bytes_processed, total_bytes);
        }
    }

    fn on_part(&mut self, index: u32, size: u64) {
        self.inner.on_part(index, size);
    }

    fn on_warning(&mut self, message: &str) {
        self.inner.on_warning(message);
    }

    fn on_complete(&mut self, bytes_processed: u64) {
        self.inner.on_complete(bytes_processed);
    }
}

/// Formats bytes as a human-readable string using IEC units.
///
/// ```rust
/// use imgbundle::progress::format_bytes_iec;
///
/// assert_eq!(format_bytes_iec(512), "512 B");
/// assert_eq!(format_bytes_iec(10 * 1024 * 1024), "10.0 MiB");
/// ```
pub fn format_bytes_iec(bytes: u64) -> String {
    let bytes_f64 = bytes as f64;
    if bytes_f64 < BYTES_KB {
        format!("{} B", bytes)
    } else if bytes_f64 < BYTES_MB {
        format!("{:.1} KiB", bytes_f64 / BYTES_KB)
    } else if bytes_f64 < BYTES_GB {
        format!("{:.1} MiB", bytes_f64 / BYTES_MB)
    } else {
        format!("{:.1} GiB", bytes_f64 / BYTES_GB)
    }
}
