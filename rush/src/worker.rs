use core::time::Duration;
use std::sync::Arc;

use tokio::{
    sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    cfg::LoadConfig,
    scenario::{Context, Scenario},
    stat::{IterationResult, Outcome, Stat},
    Clock,
};

/// Worker pool config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of workers spawned eagerly at pool start.
    pub pre_allocated: usize,
    /// Upper bound on the number of workers alive at any moment.
    pub ceiling: usize,
    /// Per-iteration timeout.
    pub iteration_timeout: Duration,
    /// How long in-flight iterations may keep running once drain starts.
    pub drain_grace: Duration,
}

impl From<&LoadConfig> for Config {
    fn from(v: &LoadConfig) -> Self {
        Self {
            pre_allocated: v.pre_allocated_vus,
            ceiling: v.max_vus,
            iteration_timeout: v.iteration_timeout,
            drain_grace: v.drain_grace,
        }
    }
}

/// Live worker counts. `active + idle` never exceeds the ceiling.
///
/// Workers that finished an iteration but have not been reclaimed by an
/// `acquire` call yet count as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub active: usize,
    pub idle: usize,
    pub ceiling: usize,
}

/// Totals accumulated while shutting the pool down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Workers aborted after the grace period expired.
    pub abandoned: u64,
    /// Workers that died panicking.
    pub panics: u64,
}

/// Bounded elastic set of workers executing iterations.
///
/// All bookkeeping happens on the control task that owns the pool: workers
/// hand themselves back over a channel and are reclaimed on the next
/// [`acquire`][WorkerPool::acquire] call, so no counter is ever mutated
/// concurrently and an acquire never waits on iteration completion.
#[derive(Debug)]
pub struct WorkerPool<F> {
    cfg: Config,
    factory: F,
    stat: Arc<Stat>,
    tag: Arc<str>,
    clock: Clock,
    /// Job channels of all live workers, indexed by worker id.
    workers: Vec<Sender<Context>>,
    idle: Vec<usize>,
    returns_tx: UnboundedSender<usize>,
    returns_rx: UnboundedReceiver<usize>,
    tasks: Vec<JoinHandle<()>>,
}

impl<F> WorkerPool<F> {
    pub fn new(cfg: Config, factory: F, stat: Arc<Stat>, tag: Arc<str>, clock: Clock) -> Self {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();

        Self {
            cfg,
            factory,
            stat,
            tag,
            clock,
            workers: Vec::new(),
            idle: Vec::new(),
            returns_tx,
            returns_rx,
            tasks: Vec::new(),
        }
    }

    /// Current worker counts.
    pub fn state(&self) -> PoolState {
        PoolState {
            active: self.workers.len() - self.idle.len(),
            idle: self.idle.len(),
            ceiling: self.cfg.ceiling,
        }
    }
}

impl<S, F> WorkerPool<F>
where
    F: FnMut(usize) -> S,
    S: Scenario + 'static,
{
    /// Spawns the pre-allocated workers, so the initial burst is absorbed
    /// without per-tick spawn latency.
    pub fn prestart(&mut self) {
        for _ in 0..self.cfg.pre_allocated {
            let id = self.spawn_worker();
            self.idle.push(id);
        }

        log::debug!("pre-allocated {} workers", self.cfg.pre_allocated);
    }

    /// Non-blocking acquire: reclaims finished workers, then pops an idle
    /// one, growing the pool by one worker if allowed.
    ///
    /// [`None`] means the ceiling is reached and every worker is busy; the
    /// caller is expected to count a drop and carry on.
    pub fn acquire(&mut self) -> Option<usize> {
        while let Ok(id) = self.returns_rx.try_recv() {
            self.idle.push(id);
        }

        if let Some(id) = self.idle.pop() {
            return Some(id);
        }
        if self.workers.len() < self.cfg.ceiling {
            return Some(self.spawn_worker());
        }

        None
    }

    /// Hands an iteration to the previously acquired worker.
    pub fn dispatch(&mut self, id: usize, ctx: Context) {
        self.workers[id].try_send(ctx).expect("acquired worker is idle");
    }

    fn spawn_worker(&mut self) -> usize {
        let id = self.workers.len();
        let (tx, rx) = mpsc::channel(1);

        let worker = Worker {
            id,
            scenario: (self.factory)(id),
            rx,
            home: self.returns_tx.clone(),
            stat: self.stat.clone(),
            tag: self.tag.clone(),
            clock: self.clock,
            timeout: self.cfg.iteration_timeout,
        };

        self.workers.push(tx);
        self.tasks.push(tokio::spawn(worker.run()));

        id
    }

    /// Stops accepting work and waits for in-flight iterations to finish.
    ///
    /// Workers still running past the grace period are aborted and their
    /// iterations recorded as transport errors, so shutdown always completes.
    pub async fn drain(mut self) -> DrainReport {
        log::debug!(
            "draining worker pool ({} workers, {} idle)",
            self.workers.len(),
            self.idle.len()
        );

        // Closing the job channels tears every worker down once its current
        // iteration ends.
        self.idle.clear();
        self.workers.clear();

        let deadline = Instant::now() + self.cfg.drain_grace;
        let mut report = DrainReport::default();
        for mut task in self.tasks.drain(..) {
            match time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if err.is_panic() {
                        log::error!("worker panicked: {err}");
                        report.panics += 1;
                    }
                }
                Err(..) => {
                    task.abort();
                    report.abandoned += 1;
                    self.stat.record(IterationResult {
                        started_at: self.clock.elapsed().saturating_sub(self.cfg.drain_grace),
                        duration: self.cfg.drain_grace,
                        outcome: Outcome::TransportError,
                        tag: self.tag.clone(),
                    });
                }
            }
        }

        if report.abandoned > 0 {
            log::warn!("abandoned {} in-flight iterations", report.abandoned);
        }

        report
    }
}

/// Per-worker task.
///
/// Executes dispatched iterations strictly sequentially until the pool
/// closes the job channel.
#[derive(Debug)]
struct Worker<S> {
    id: usize,
    scenario: S,
    rx: Receiver<Context>,
    home: UnboundedSender<usize>,
    stat: Arc<Stat>,
    tag: Arc<str>,
    clock: Clock,
    timeout: Duration,
}

impl<S> Worker<S>
where
    S: Scenario,
{
    async fn run(mut self) {
        while let Some(ctx) = self.rx.recv().await {
            let started_at = self.clock.elapsed();
            let start = Instant::now();

            // A stuck iteration must not outlive its own deadline: timeouts
            // come back as transport errors, like any other I/O failure.
            let outcome = match time::timeout(self.timeout, self.scenario.execute(&ctx)).await {
                Ok(outcome) => outcome,
                Err(..) => Outcome::TransportError,
            };

            self.stat.record(IterationResult {
                started_at,
                duration: start.elapsed(),
                outcome,
                tag: self.tag.clone(),
            });

            if self.home.send(self.id).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scenario::testing::SleepScenario;

    fn config(pre_allocated: usize, ceiling: usize) -> Config {
        Config {
            pre_allocated,
            ceiling,
            iteration_timeout: Duration::from_secs(60),
            drain_grace: Duration::from_secs(1),
        }
    }

    fn pool(
        cfg: Config,
        latency: Duration,
        stat: &Arc<Stat>,
    ) -> WorkerPool<impl FnMut(usize) -> SleepScenario> {
        let scenario = SleepScenario::success(latency);
        WorkerPool::new(
            cfg,
            move |_id| scenario.clone(),
            stat.clone(),
            Arc::from("test"),
            Clock::start(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_respected() {
        let stat = Arc::new(Stat::new());
        let mut pool = pool(config(2, 4), Duration::from_millis(100), &stat);
        pool.prestart();

        let mut acquired = 0;
        for seq in 0..10 {
            if let Some(id) = pool.acquire() {
                pool.dispatch(id, Context { seq });
                acquired += 1;
            }
        }

        assert_eq!(acquired, 4);
        assert_eq!(pool.state().active, 4);
        assert_eq!(pool.state().idle, 0);
        assert!(pool.acquire().is_none());

        // Workers come back once their iterations finish.
        time::sleep(Duration::from_millis(150)).await;
        assert!(pool.acquire().is_some());

        pool.drain().await;
        assert_eq!(stat.totals().success, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elastic_growth() {
        let stat = Arc::new(Stat::new());
        let mut pool = pool(config(1, 8), Duration::from_millis(50), &stat);
        pool.prestart();

        for seq in 0..5 {
            let id = pool.acquire().expect("below ceiling");
            pool.dispatch(id, Context { seq });
        }

        // One pre-allocated worker plus four grown on demand.
        assert_eq!(pool.workers.len(), 5);
        assert_eq!(pool.state().active, 5);

        let report = pool.drain().await;
        assert_eq!(report, DrainReport::default());
        assert_eq!(stat.totals().success, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_timeout_is_transport_error() {
        let stat = Arc::new(Stat::new());
        let cfg = Config {
            iteration_timeout: Duration::from_millis(100),
            ..config(1, 1)
        };
        let mut pool = pool(cfg, Duration::from_secs(10), &stat);
        pool.prestart();

        let id = pool.acquire().unwrap();
        pool.dispatch(id, Context { seq: 0 });

        // The worker is usable again right after the timeout fires.
        time::sleep(Duration::from_millis(150)).await;
        assert!(pool.acquire().is_some());

        pool.drain().await;
        assert_eq!(stat.totals().transport_error, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_inflight() {
        let stat = Arc::new(Stat::new());
        let mut pool = pool(config(2, 2), Duration::from_millis(50), &stat);
        pool.prestart();

        for seq in 0..2 {
            let id = pool.acquire().unwrap();
            pool.dispatch(id, Context { seq });
        }

        let report = pool.drain().await;
        assert_eq!(report.abandoned, 0);
        assert_eq!(stat.totals().success, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_counts_panics() {
        let stat = Arc::new(Stat::new());
        let mut pool = WorkerPool::new(
            config(1, 1),
            |_id| crate::scenario::testing::PanicScenario,
            stat.clone(),
            Arc::from("test"),
            Clock::start(),
        );
        pool.prestart();

        let id = pool.acquire().unwrap();
        pool.dispatch(id, Context { seq: 0 });

        let report = pool.drain().await;
        assert_eq!(report.panics, 1);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_abandons_stuck_workers() {
        let stat = Arc::new(Stat::new());
        let cfg = Config {
            iteration_timeout: Duration::from_secs(2000),
            ..config(2, 2)
        };
        let mut pool = pool(cfg, Duration::from_secs(1000), &stat);
        pool.prestart();

        for seq in 0..2 {
            let id = pool.acquire().unwrap();
            pool.dispatch(id, Context { seq });
        }

        let report = pool.drain().await;
        assert_eq!(report.abandoned, 2);

        let totals = stat.totals();
        assert_eq!(totals.transport_error, 2);
        assert_eq!(totals.total, 2);
    }
}
