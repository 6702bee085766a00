use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::sync::Arc;

use tokio::time;

use crate::{
    cfg::LoadConfig,
    scenario::{Context, Scenario},
    stat::Stat,
    worker::WorkerPool,
    Clock,
};

/// The arrival control loop.
///
/// Fires one dispatch attempt per `time_unit / rate` interval for the whole
/// run duration, no matter how long individual iterations take. Tick N is
/// scheduled at the absolute offset `time_unit * N / rate` from run start,
/// computed in integer nanoseconds, so rounding never accumulates and the
/// achieved rate stays put over long runs.
///
/// A tick that finds no worker capacity records a drop and moves on; the
/// loop itself never waits on anything but its own timer.
#[derive(Debug)]
pub struct Scheduler {
    rate: u64,
    time_unit: Duration,
    duration: Duration,
    tag: Arc<str>,
    is_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(load: &LoadConfig, tag: Arc<str>, is_running: Arc<AtomicBool>) -> Self {
        Self {
            rate: load.rate,
            time_unit: load.time_unit,
            duration: load.duration,
            tag,
            is_running,
        }
    }

    /// Absolute offset of the given tick from run start.
    #[inline]
    fn tick_offset(&self, seq: u64) -> Duration {
        let nanos = self.time_unit.as_nanos() * seq as u128 / self.rate as u128;

        Duration::from_nanos(nanos as u64)
    }

    /// Runs the loop until the duration elapses or the run is cancelled.
    ///
    /// Returns the number of dispatch attempts made, drops included.
    pub async fn run<S, F>(&self, pool: &mut WorkerPool<F>, clock: &Clock, stat: &Stat) -> u64
    where
        F: FnMut(usize) -> S,
        S: Scenario + 'static,
    {
        let mut seq = 0;
        loop {
            let offset = self.tick_offset(seq);
            if offset >= self.duration {
                break;
            }

            time::sleep_until(clock.started_at() + offset).await;
            if !self.is_running.load(Ordering::SeqCst) {
                log::info!("cancelled after {} ticks", seq);
                break;
            }

            match pool.acquire() {
                Some(id) => pool.dispatch(id, Context { seq }),
                None => stat.on_drop(&self.tag),
            }

            seq += 1;
        }

        seq
    }
}
