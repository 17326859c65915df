//! Timing macros used by the session and device layers.

/// Time the enclosing scope as a `perf` span.
///
/// Extra fields are recorded on the span itself. The span is logged on drop
/// unless it finished under the process-wide threshold
/// ([`crate::performance::set_span_threshold_us`]).
///
/// ```rust
/// use rexec_tracing::perf_span;
///
/// let _span = perf_span!("device_run", module = 3, args = 2);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::new($name, $crate::performance::span_threshold_us())
    };
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::performance::PerformanceSpan::from_span(
            $crate::__tracing::debug_span!("perf", name = $name, $($field = $value),+),
            $crate::performance::span_threshold_us(),
        )
    };
}

/// Debug event tagged with `event = $name`.
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::__tracing::debug!(event = $name, $($field = $value),+)
    };
}

/// Evaluate `$block`, log how long it took and return
/// `(value, duration_us)`.
///
/// ```rust
/// use rexec_tracing::timed_block;
///
/// let (payload, us) = timed_block!("encode", { vec![0u8; 16] });
/// assert_eq!(payload.len(), 16);
/// # let _ = us;
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let value = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, duration_us, "timed_block_complete");
        (value, duration_us)
    }};
}
