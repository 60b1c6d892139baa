use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Summary of recorded request durations.
///
/// `ok` is false when there were no samples, in which case every other
/// field is zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimingStats {
    pub mean: Duration,
    pub stddev: Duration,
    /// Sample variance in squared nanoseconds
    pub variance: f64,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub count: usize,
    pub ok: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
}

impl RunningStats {
    fn add(&mut self, nanos: u64) {
        if self.count == 0 {
            self.min = nanos;
            self.max = nanos;
        } else {
            self.min = self.min.min(nanos);
            self.max = self.max.max(nanos);
        }

        self.count += 1;
        let value = nanos as f64;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count as f64 - 1.0)
    }
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (((pct / 100.0) * sorted.len() as f64).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[index]
}

fn nanos(value: f64) -> Duration {
    Duration::from_nanos(value.round().max(0.0) as u64)
}

/// Per-request duration collector
#[derive(Debug, Clone, Default)]
pub struct Timings {
    samples: Vec<u64>,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, duration: Duration) {
        self.samples.push(duration.as_nanos().min(u64::MAX as u128) as u64);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Raw samples in nanoseconds, in recording order
    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    /// Statistics over the recorded samples. Zero-length samples (calls that
    /// never reached the transport) are skipped unless `include_zeros`.
    pub fn stats(&self, include_zeros: bool) -> TimingStats {
        let mut sorted: Vec<u64> = self
            .samples
            .iter()
            .copied()
            .filter(|sample| include_zeros || *sample > 0)
            .collect();
        if sorted.is_empty() {
            return TimingStats::default();
        }
        sorted.sort_unstable();

        let mut running = RunningStats::default();
        for sample in &sorted {
            running.add(*sample);
        }
        let variance = running.variance();

        TimingStats {
            mean: nanos(running.mean),
            stddev: nanos(variance.sqrt()),
            variance,
            min: Duration::from_nanos(running.min),
            max: Duration::from_nanos(running.max),
            p50: Duration::from_nanos(percentile(&sorted, 50.0)),
            p90: Duration::from_nanos(percentile(&sorted, 90.0)),
            p99: Duration::from_nanos(percentile(&sorted, 99.0)),
            count: sorted.len(),
            ok: true,
        }
    }
}
