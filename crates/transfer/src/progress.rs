use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default spacing between aggregate progress notifications.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with the cumulative number of bytes transferred.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Aggregates byte counts from many workers into throttled notifications.
///
/// Workers call [`add`](Self::add) after every completed write; the callback
/// fires at most once per interval, plus a final [`flush`](Self::flush).
pub struct ProgressReporter {
    done: AtomicU64,
    last_emit: Mutex<Option<Instant>>,
    interval: Duration,
    callback: ProgressCallback,
}

impl ProgressReporter {
    /// Creates a reporter whose count starts at `baseline` (bytes already on
    /// the destination from an earlier attempt).
    pub fn new(callback: ProgressCallback, interval: Duration, baseline: u64) -> Self {
        Self {
            done: AtomicU64::new(baseline),
            last_emit: Mutex::new(None),
            interval,
            callback,
        }
    }

    /// Adds `bytes` and notifies if the interval has elapsed.
    pub fn add(&self, bytes: u64) {
        let total = self.done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let due = {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if due {
            (self.callback)(total);
        }
    }

    /// Notifies with the current total regardless of the interval.
    pub fn flush(&self) {
        if let Ok(mut last) = self.last_emit.lock() {
            *last = Some(Instant::now());
        }
        (self.callback)(self.total());
    }

    pub fn total(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(100),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` transferred since the previous sample.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    fn add_sample_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(self.window_size) {
            self.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window; 0 with fewer than
    /// two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes predate it.
        let total: u64 = self.samples[1..].iter().map(|s| s.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to transfer `remaining_bytes`, or `None` while the speed
    /// is unknown.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
