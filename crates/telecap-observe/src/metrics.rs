use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free maximum: raises `cell` to `value` unless it is already higher.
fn raise_to(cell: &AtomicU64, value: u64) {
    let mut seen = cell.load(Ordering::Relaxed);
    while seen < value {
        match cell.compare_exchange_weak(seen, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(now) => seen = now,
        }
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn sub(&self, delta: u64) {
        self.value.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn max(&self, value: u64) {
        raise_to(&self.value, value);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Running duration aggregate: sample count, sum, and peak, readable while
/// writers are still recording. Microsecond resolution is plenty for tick
/// handlers and file IO.
#[derive(Debug, Default)]
pub struct DurationAgg {
    samples: AtomicU64,
    sum_us: AtomicU64,
    peak_us: AtomicU64,
}

impl DurationAgg {
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        raise_to(&self.peak_us, us);
    }

    pub fn summary(&self) -> DurationSummary {
        DurationSummary {
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
            peak_us: self.peak_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationSummary {
    pub samples: u64,
    pub sum_us: u64,
    pub peak_us: u64,
}

impl DurationSummary {
    pub fn mean_us(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.sum_us / self.samples
        }
    }
}

/// Records how long `f` took into `agg`, including the error paths.
pub fn timed<T>(agg: &DurationAgg, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = f();
    agg.record(started.elapsed());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_max_is_monotonic() {
        let g = Gauge::default();
        g.max(10);
        g.max(5);
        assert_eq!(g.get(), 10);
        g.max(20);
        assert_eq!(g.get(), 20);
    }

    #[test]
    fn duration_agg_tracks_count_sum_and_peak() {
        let agg = DurationAgg::default();
        agg.record(Duration::from_millis(2));
        agg.record(Duration::from_millis(8));
        let summary = agg.summary();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.sum_us, 10_000);
        assert_eq!(summary.peak_us, 8_000);
        assert_eq!(summary.mean_us(), 5_000);
    }

    #[test]
    fn empty_summary_has_zero_mean() {
        let agg = DurationAgg::default();
        assert_eq!(agg.summary().mean_us(), 0);
    }

    #[test]
    fn timed_records_through_both_paths() {
        let agg = DurationAgg::default();
        let value = timed(&agg, || 7);
        assert_eq!(value, 7);
        let err: Result<(), &str> = timed(&agg, || Err("boom"));
        assert!(err.is_err());
        assert_eq!(agg.summary().samples, 2);
    }
}
