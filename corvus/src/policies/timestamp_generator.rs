use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{Duration, Instant};
use tracing::warn;

/// Generates client-side microsecond timestamps attached to mutating
/// requests.
pub trait TimestampGenerator: Send + Sync {
    fn next_timestamp(&self) -> i64;
}

/// Wall-clock generator with no monotonicity guarantee.
#[derive(Default)]
pub struct SimpleTimestampGenerator {}

impl SimpleTimestampGenerator {
    pub fn new() -> Self {
        SimpleTimestampGenerator {}
    }
}

impl TimestampGenerator for SimpleTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

struct MonotonicTimestampGeneratorWarningsCfg {
    warning_threshold: Duration,
    warning_interval: Duration,
}

/// Strictly monotonic timestamp generator, the default.
///
/// When the system clock fails to advance (or moves backwards), the
/// generator keeps emitting `last + 1` microsecond, and warns about the
/// skew at most once per `warning_interval` (default 1 s).
/// Monotonicity holds per generator instance only.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    last_warning: Mutex<Instant>,
    config: Option<MonotonicTimestampGeneratorWarningsCfg>,
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        MonotonicTimestampGenerator {
            last: AtomicI64::new(0),
            last_warning: Mutex::new(Instant::now()),
            config: Some(MonotonicTimestampGeneratorWarningsCfg {
                warning_threshold: Duration::from_secs(1),
                warning_interval: Duration::from_secs(1),
            }),
        }
    }

    pub fn with_warning_times(
        mut self,
        warning_threshold: Duration,
        warning_interval: Duration,
    ) -> Self {
        self.config = Some(MonotonicTimestampGeneratorWarningsCfg {
            warning_threshold,
            warning_interval,
        });
        self
    }

    pub fn without_warnings(mut self) -> Self {
        self.config = None;
        self
    }

    fn compute_next(&self, last: i64) -> i64 {
        let current = SystemTime::now().duration_since(UNIX_EPOCH);
        if let Ok(cur_time) = current {
            let u_cur = cur_time.as_micros() as i64;
            if u_cur > last {
                return u_cur;
            }
            if let Some(cfg) = self.config.as_ref() {
                if last - u_cur > cfg.warning_threshold.as_micros() as i64 {
                    let mut last_warn = self.last_warning.lock().unwrap();
                    let now = Instant::now();
                    if now >= *last_warn + cfg.warning_interval {
                        *last_warn = now;
                        drop(last_warn);
                        warn!(
                            "Clock skew detected. The current time ({}) was {} \
                            microseconds behind the last generated timestamp ({}). \
                            Timestamps will be artificially incremented to stay \
                            monotonic.",
                            u_cur,
                            last - u_cur,
                            last
                        );
                    }
                }
            }
        } else {
            warn!("Clock skew detected: the current time is behind the UNIX epoch.");
        }

        last + 1
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let cur = self.compute_next(last);
            if self
                .last
                .compare_exchange(last, cur, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return cur;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_generator_is_monotonic() {
        let generator = MonotonicTimestampGenerator::new();
        let mut prev = None;
        for _ in 0..1000 {
            let cur = generator.next_timestamp();
            if let Some(prev_val) = prev {
                assert!(cur > prev_val);
            }
            prev = Some(cur);
        }
    }

    #[test]
    fn monotonic_generator_advances_past_stuck_clock() {
        let generator = MonotonicTimestampGenerator::new().without_warnings();
        // Force the generator far ahead of the wall clock; it must keep
        // incrementing by one instead of going backwards.
        generator.last.store(i64::MAX - 10, Ordering::SeqCst);
        assert_eq!(generator.next_timestamp(), i64::MAX - 9);
        assert_eq!(generator.next_timestamp(), i64::MAX - 8);
    }

    #[test]
    fn monotonic_generator_is_monotonic_with_concurrency() {
        use std::collections::HashSet;
        use std::sync::Arc;

        const ITERATIONS: usize = 1000;
        const THREADS: usize = 8;
        let generator = Arc::new(MonotonicTimestampGenerator::new());
        let sets: Vec<HashSet<i64>> = std::thread::scope(|s| {
            (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let timestamps: Vec<i64> =
                            (0..ITERATIONS).map(|_| generator.next_timestamp()).collect();
                        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
                        HashSet::from_iter(timestamps)
                    })
                })
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let full_set: HashSet<i64> = sets.iter().flatten().copied().collect();
        assert_eq!(full_set.len(), ITERATIONS * THREADS, "timestamps collided");
    }
}
