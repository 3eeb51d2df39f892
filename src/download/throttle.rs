//! Progress throttling and speed smoothing for item transfers.
//!
//! The inner transfer loop observes every chunk; publishing each one would
//! flood the bus. A [`ProgressThrottler`] is constructed once per item and
//! collapses updates to at most one per 100 ms, always passing through the
//! first update and the final/terminal one. Speed is smoothed with a moving
//! average over the last ten samples.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between emitted frames per item.
pub const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Samples retained for the moving speed average.
const SPEED_WINDOW: usize = 10;

/// One emitted progress frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressFrame {
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// Expected size when known.
    pub bytes_total: Option<u64>,
    /// Smoothed speed in bytes/second, once two samples exist.
    pub speed_bps: Option<f64>,
    /// Estimated seconds to completion, when size and speed are known.
    pub eta_s: Option<u64>,
}

/// Per-item progress rate limiter.
///
/// Two methods: [`update`](Self::update) for inner-loop chunks (may
/// suppress) and [`finalize`](Self::finalize) for the last word (always
/// emits).
#[derive(Debug)]
pub struct ProgressThrottler {
    last_emit: Option<Instant>,
    samples: VecDeque<(Instant, u64)>,
    emitted_any: bool,
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressThrottler {
    /// Creates a throttler for one item.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_emit: None,
            samples: VecDeque::with_capacity(SPEED_WINDOW),
            emitted_any: false,
        }
    }

    /// Observes an inner-loop progress update.
    ///
    /// Returns a frame to publish, or `None` when the update falls inside
    /// the 100 ms window. The first update and any update that completes a
    /// known total are always emitted.
    pub fn update(&mut self, bytes_done: u64, bytes_total: Option<u64>) -> Option<ProgressFrame> {
        let now = Instant::now();
        self.push_sample(now, bytes_done);

        let is_first = !self.emitted_any;
        let is_complete = bytes_total.is_some_and(|total| bytes_done >= total);
        let window_open = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= MIN_EMIT_INTERVAL);

        if !(is_first || is_complete || window_open) {
            return None;
        }

        Some(self.emit(now, bytes_done, bytes_total))
    }

    /// Emits the final frame unconditionally (100% update or terminal
    /// state change).
    pub fn finalize(&mut self, bytes_done: u64, bytes_total: Option<u64>) -> ProgressFrame {
        let now = Instant::now();
        self.push_sample(now, bytes_done);
        self.emit(now, bytes_done, bytes_total)
    }

    fn emit(&mut self, now: Instant, bytes_done: u64, bytes_total: Option<u64>) -> ProgressFrame {
        self.last_emit = Some(now);
        self.emitted_any = true;

        let speed_bps = self.smoothed_speed();
        let eta_s = match (speed_bps, bytes_total) {
            (Some(speed), Some(total)) if speed > 0.0 && total > bytes_done => {
                Some(duration_estimate(total - bytes_done, speed))
            }
            _ => None,
        };

        ProgressFrame {
            bytes_done,
            bytes_total,
            speed_bps,
            eta_s,
        }
    }

    fn push_sample(&mut self, now: Instant, bytes_done: u64) {
        if self.samples.len() == SPEED_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((now, bytes_done));
    }

    /// Moving average over the retained window: bytes covered by the window
    /// divided by the window's span.
    fn smoothed_speed(&self) -> Option<f64> {
        let (first_at, first_bytes) = self.samples.front()?;
        let (last_at, last_bytes) = self.samples.back()?;

        let span = last_at.duration_since(*first_at).as_secs_f64();
        if span <= 0.0 || last_bytes <= first_bytes {
            return None;
        }
        Some(bytes_f64(last_bytes - first_bytes) / span)
    }
}

#[allow(clippy::cast_precision_loss)]
fn bytes_f64(bytes: u64) -> f64 {
    bytes as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_estimate(remaining: u64, speed: f64) -> u64 {
    (bytes_f64(remaining) / speed).ceil() as u64
}
