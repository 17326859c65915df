//! Timing helpers for transfers and remote invocations.
//!
//! ```rust
//! use rexec_tracing::performance::{record_transfer, PerformanceSpan, TransferDirection};
//!
//! let span = PerformanceSpan::new("stage_artifact", Some(100));
//! drop(span); // logged only if it took at least 100us
//!
//! record_transfer(TransferDirection::HostToDevice, 4096, 12);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

const NO_THRESHOLD: u64 = u64::MAX;

static SPAN_THRESHOLD_US: AtomicU64 = AtomicU64::new(NO_THRESHOLD);

/// Set the minimum duration logged by spans started with
/// [`perf_span!`](crate::perf_span). `None` logs every span.
pub fn set_span_threshold_us(threshold_us: Option<u64>) {
    SPAN_THRESHOLD_US.store(threshold_us.unwrap_or(NO_THRESHOLD), Ordering::Relaxed);
}

pub fn span_threshold_us() -> Option<u64> {
    let threshold = SPAN_THRESHOLD_US.load(Ordering::Relaxed);
    (threshold != NO_THRESHOLD).then_some(threshold)
}

/// RAII guard that logs its own lifetime when dropped.
///
/// With a threshold set, spans shorter than the threshold are discarded.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a span at an explicit level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    /// Time an existing span, typically one carrying extra fields.
    pub fn from_span(span: tracing::Span, threshold_us: Option<u64>) -> Self {
        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying span so nested events are attributed to it.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|threshold| elapsed_us >= threshold) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Direction of a host/device copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => f.write_str("H2D"),
            TransferDirection::DeviceToHost => f.write_str("D2H"),
        }
    }
}

/// Bandwidth in MiB/s, zero for transfers too fast to time.
pub fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

/// Record a completed host/device copy.
pub fn record_transfer(direction: TransferDirection, bytes: usize, duration_us: u64) {
    tracing::debug!(
        direction = %direction,
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps(bytes, duration_us),
        "tensor_transfer"
    );
}

/// Record a completed remote invocation.
pub fn record_invocation(executor: &str, entry: &str, num_args: usize, duration_us: u64) {
    tracing::debug!(
        executor = executor,
        entry = entry,
        num_args = num_args,
        duration_us = duration_us,
        duration_ms = duration_us as f64 / 1000.0,
        "remote_invocation"
    );
}
