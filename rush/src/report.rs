use core::{
    fmt::{self, Display, Formatter},
    time::Duration,
};
use std::{error::Error, fs::File, io::BufWriter, path::Path};

use serde::Serialize;

use crate::{
    stat::{Counts, Snapshot},
    threshold::RunVerdict,
};

/// Final run report: aggregate counters plus the verdict.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Run duration in seconds, drain included.
    pub elapsed_secs: f64,
    /// Dispatch attempts made by the scheduler, drops included.
    pub attempts: u64,
    pub iterations: u64,
    pub successes: u64,
    pub check_failures: u64,
    pub transport_errors: u64,
    /// Attempts that found no worker capacity. A high value means the
    /// configured ceiling cannot sustain the configured rate.
    pub dropped: u64,
    /// Executed iterations per second, measured over the whole run.
    pub achieved_rate: f64,
    pub latency_ms: Option<LatencySummary>,
    #[serde(flatten)]
    pub verdict: RunVerdict,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub max: f64,
}

impl Report {
    pub fn new(elapsed: Duration, attempts: u64, snapshot: &Snapshot, verdict: RunVerdict) -> Self {
        let Counts {
            total,
            success,
            check_failed,
            transport_error,
            dropped,
        } = snapshot.counts(None);

        let latency_ms = match (
            snapshot.percentile_ms(None, 50.0),
            snapshot.percentile_ms(None, 90.0),
            snapshot.percentile_ms(None, 99.0),
            snapshot.percentile_ms(None, 100.0),
        ) {
            (Some(p50), Some(p90), Some(p99), Some(max)) => Some(LatencySummary { p50, p90, p99, max }),
            _ => None,
        };

        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            attempts,
            iterations: total,
            successes: success,
            check_failures: check_failed,
            transport_errors: transport_error,
            dropped,
            achieved_rate: total as f64 / elapsed.as_secs_f64().max(f64::MIN_POSITIVE),
            latency_ms,
            verdict,
        }
    }

    #[inline]
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    /// Writes this report as pretty-printed JSON.
    pub fn write_json<P>(&self, path: P) -> Result<(), Box<dyn Error>>
    where
        P: AsRef<Path>,
    {
        let wr = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(wr, self)?;

        Ok(())
    }
}

impl Display for Report {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let state = if self.passed() { "PASSED" } else { "FAILED" };
        writeln!(fmt, "run {state} in {:.1}s", self.elapsed_secs)?;
        writeln!(
            fmt,
            "iterations: {} ({} ok, {} check-failed, {} transport-errors), dropped: {}",
            self.iterations, self.successes, self.check_failures, self.transport_errors, self.dropped,
        )?;
        writeln!(fmt, "achieved rate: {:.1}/s", self.achieved_rate)?;
        if let Some(latency) = &self.latency_ms {
            writeln!(
                fmt,
                "latency ms: p(50)={:.2} p(90)={:.2} p(99)={:.2} max={:.2}",
                latency.p50, latency.p90, latency.p99, latency.max,
            )?;
        }
        if !self.verdict.thresholds.is_empty() {
            writeln!(fmt, "thresholds:")?;
            for verdict in &self.verdict.thresholds {
                let state = if verdict.passed { "PASS" } else { "FAIL" };
                match verdict.observed {
                    Some(observed) => {
                        writeln!(fmt, "  {state} {} (observed {observed:.4})", verdict.spec)?
                    }
                    None => writeln!(fmt, "  {state} {} (no data)", verdict.spec)?,
                }
            }
        }
        if let Some(fatal) = &self.verdict.fatal {
            writeln!(fmt, "fatal: {fatal}")?;
        }

        Ok(())
    }
}
