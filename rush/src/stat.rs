use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Final disposition of a single iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The scenario completed and all its checks held.
    Success,
    /// The scenario completed, but a check did not hold.
    CheckFailed,
    /// The underlying transport failed, or the iteration hit its timeout.
    TransportError,
}

/// Outcome of one executed iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Offset from run start at which the iteration began.
    pub started_at: Duration,
    /// Wall-clock time the iteration took.
    pub duration: Duration,
    pub outcome: Outcome,
    pub tag: Arc<str>,
}

#[derive(Debug, Default, Clone)]
struct Series {
    results: Vec<IterationResult>,
    dropped: u64,
}

/// Concurrent sink for iteration outcomes, keyed by scenario tag.
///
/// Workers append, the run controller reads. Each series is append-only and
/// no iteration is ever partially visible: both writes and snapshots go
/// through the same lock.
#[derive(Debug, Default)]
pub struct Stat {
    series: Mutex<HashMap<Arc<str>, Series>>,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the given result to its tag's series.
    pub fn record(&self, result: IterationResult) {
        let mut series = self.series.lock().expect("no poison");
        series.entry(result.tag.clone()).or_default().results.push(result);
    }

    /// Counts a dispatch attempt that found no worker capacity.
    pub fn on_drop(&self, tag: &Arc<str>) {
        let mut series = self.series.lock().expect("no poison");
        series.entry(tag.clone()).or_default().dropped += 1;
    }

    /// Running counts over all series.
    pub fn totals(&self) -> Counts {
        let series = self.series.lock().expect("no poison");

        let mut out = Counts::default();
        for series in series.values() {
            out.dropped += series.dropped;
            for result in &series.results {
                out.count(result.outcome);
            }
        }

        out
    }

    /// Returns a stable point-in-time copy of all series.
    ///
    /// Results recorded after this call are not visible through the returned
    /// value.
    pub fn snapshot(&self) -> Snapshot {
        let series = self.series.lock().expect("no poison");

        Snapshot { series: series.clone() }
    }
}

/// Per-outcome iteration counts plus dropped dispatch attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub total: u64,
    pub success: u64,
    pub check_failed: u64,
    pub transport_error: u64,
    pub dropped: u64,
}

impl Counts {
    #[inline]
    fn count(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::CheckFailed => self.check_failed += 1,
            Outcome::TransportError => self.transport_error += 1,
        }
    }
}

/// Immutable view of all series at a single point in time.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    series: HashMap<Arc<str>, Series>,
}

impl Snapshot {
    fn results<'a>(&'a self, tag: Option<&'a str>) -> impl Iterator<Item = &'a IterationResult> {
        self.series
            .iter()
            .filter(move |(name, ..)| tag.map_or(true, |tag| name.as_ref() == tag))
            .flat_map(|(.., series)| series.results.iter())
    }

    /// Counts over series matching the tag filter, all series if none.
    pub fn counts(&self, tag: Option<&str>) -> Counts {
        let mut out = Counts::default();
        for (name, series) in &self.series {
            if !tag.map_or(true, |tag| name.as_ref() == tag) {
                continue;
            }

            out.dropped += series.dropped;
            for result in &series.results {
                out.count(result.outcome);
            }
        }

        out
    }

    /// Nearest-rank percentile over matching iteration durations, in
    /// milliseconds.
    ///
    /// The percentile is the smallest value whose cumulative frequency covers
    /// at least `q` percent of the series: for a sorted series of n values
    /// the rank is ceil(q / 100 * n), clamped to [1, n], and the result is
    /// the value at that rank. No interpolation. With 10000 values of which
    /// 9999 are equal, p(99.99) lands on rank 9999 and returns the common
    /// value, not the outlier.
    ///
    /// Returns [`None`] if no iteration matches the filter.
    pub fn percentile_ms(&self, tag: Option<&str>, q: f64) -> Option<f64> {
        let mut durations: Vec<f64> = self
            .results(tag)
            .map(|result| result.duration.as_secs_f64() * 1e3)
            .collect();
        if durations.is_empty() {
            return None;
        }
        durations.sort_by(f64::total_cmp);

        let rank = ((q / 100.0) * durations.len() as f64).ceil().max(1.0) as usize;

        Some(durations[rank.min(durations.len()) - 1])
    }

    /// Failed share of matching iterations: (check failures + transport
    /// errors) / total.
    ///
    /// Dropped dispatch attempts never became iterations and are excluded.
    /// Returns [`None`] if no iteration matches the filter.
    pub fn failure_rate(&self, tag: Option<&str>) -> Option<f64> {
        let counts = self.counts(tag);
        if counts.total == 0 {
            return None;
        }

        Some((counts.check_failed + counts.transport_error) as f64 / counts.total as f64)
    }
}
