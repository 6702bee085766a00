use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};

use crate::{
    cfg::{Config, ModeConfig},
    report::Report,
    scenario::{http::HttpScenario, Scenario},
    scheduler::Scheduler,
    stat::Stat,
    threshold::RunVerdict,
    worker::WorkerPool,
    Clock, VecProduce,
};

/// Run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configured,
    Running,
    Draining,
    Reported,
}

/// Owns a run from start to the final report.
#[derive(Debug)]
pub struct Runtime {
    cfg: Config,
    state: State,
    is_running: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));

        Self {
            cfg,
            state: State::Configured,
            is_running,
        }
    }

    /// Cancellation flag.
    ///
    /// Clearing it stops new ticks and acquires immediately; in-flight
    /// iterations still get the drain grace period.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.is_running.clone()
    }

    pub async fn run(self) -> Report {
        match self.cfg.mode.clone() {
            ModeConfig::Http(cfg) => {
                let data = Arc::new(VecProduce::new(cfg.requests.clone()));
                let addr = cfg.addr;
                let expect_status = cfg.expect_status;
                let tcp_no_delay = cfg.tcp_no_delay;

                let factory = move |_id: usize| {
                    HttpScenario::new(addr, data.clone(), expect_status, tcp_no_delay)
                };

                self.run_with(factory).await
            }
        }
    }

    /// Runs the engine with the given per-worker scenario factory.
    pub async fn run_with<S, F>(mut self, factory: F) -> Report
    where
        F: FnMut(usize) -> S,
        S: Scenario + 'static,
    {
        let clock = Clock::start();
        let stat = Arc::new(Stat::new());
        let tag: Arc<str> = Arc::from(self.cfg.tag.as_str());

        self.transition(State::Running);
        log::info!(
            "running at {}/{:?} for {:?} with {}..{} VUs",
            self.cfg.load.rate,
            self.cfg.load.time_unit,
            self.cfg.load.duration,
            self.cfg.load.pre_allocated_vus,
            self.cfg.load.max_vus,
        );

        let mut pool = WorkerPool::new(
            (&self.cfg.load).into(),
            factory,
            stat.clone(),
            tag.clone(),
            clock,
        );
        pool.prestart();

        let progress = tokio::spawn(progress_loop(stat.clone(), clock, self.is_running.clone()));

        let scheduler = Scheduler::new(&self.cfg.load, tag, self.is_running.clone());
        let attempts = scheduler.run(&mut pool, &clock, &stat).await;

        self.transition(State::Draining);
        self.is_running.store(false, Ordering::SeqCst);
        log::debug!("pool at drain: {:?}", pool.state());
        let drain = pool.drain().await;
        progress.abort();

        self.transition(State::Reported);
        let snapshot = stat.snapshot();
        let fatal = match drain.panics {
            0 => None,
            n => Some(format!("{n} worker task(s) panicked")),
        };
        let verdict = RunVerdict::evaluate(&self.cfg.thresholds, &snapshot, fatal);

        Report::new(clock.elapsed(), attempts, &snapshot, verdict)
    }

    fn transition(&mut self, next: State) {
        log::debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

async fn progress_loop(stat: Arc<Stat>, clock: Clock, is_running: Arc<AtomicBool>) {
    let mut interval = time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    while is_running.load(Ordering::Relaxed) {
        interval.tick().await;

        let totals = stat.totals();
        log::info!(
            "{:.0?}: {} iterations ({} ok, {} failed, {} dropped)",
            clock.elapsed(),
            totals.total,
            totals.success,
            totals.check_failed + totals.transport_error,
            totals.dropped,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cfg::{LoadConfig, LoadProfile},
        scenario::testing::{PanicScenario, SleepScenario},
        stat::Outcome,
        threshold::ThresholdSpec,
    };

    fn load(rate: u64, duration_secs: u64, pre_allocated_vus: usize, max_vus: usize) -> LoadConfig {
        LoadProfile {
            rate,
            time_unit: 1,
            duration: duration_secs,
            pre_allocated_vus,
            max_vus,
            iteration_timeout_ms: 4000,
            drain_grace: 5,
            thresholds: Vec::new(),
        }
        .try_into()
        .unwrap()
    }

    fn config(load: LoadConfig, thresholds: Vec<ThresholdSpec>) -> Config {
        Config {
            mode: ModeConfig::Http(crate::scenario::http::Config {
                addr: "127.0.0.1:80".parse().unwrap(),
                expect_status: 200,
                tcp_no_delay: false,
                requests: Vec::new(),
            }),
            load,
            thresholds,
            tag: "main_scenario".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_passes_thresholds() {
        let thresholds: Vec<ThresholdSpec> = vec![
            "iteration_duration{scenario:main_scenario}:p(99.99)<50"
                .parse()
                .unwrap(),
            "iteration_failed{scenario:main_scenario}:rate<0.0001"
                .parse()
                .unwrap(),
        ];
        let runtime = Runtime::new(config(load(1000, 1, 200, 1000), thresholds));

        let scenario = SleepScenario::success(Duration::from_millis(10));
        let report = runtime.run_with(move |_id| scenario.clone()).await;

        assert!(report.passed());
        assert_eq!(report.attempts, 1000);
        assert_eq!(report.iterations, 1000);
        assert_eq!(report.dropped, 0);

        let p = report.verdict.thresholds[0].observed.unwrap();
        assert!(p < 50.0, "p(99.99) = {p}");
        assert_eq!(report.verdict.thresholds[1].observed, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_on_check_failures() {
        let thresholds: Vec<ThresholdSpec> =
            vec!["iteration_failed:rate<0.0001".parse().unwrap()];
        let runtime = Runtime::new(config(load(100, 1, 10, 10), thresholds));

        let scenario = SleepScenario::new(Duration::from_millis(1), Outcome::CheckFailed);
        let report = runtime.run_with(move |_id| scenario.clone()).await;

        assert!(!report.passed());
        assert_eq!(report.check_failures, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_on_missing_data() {
        // Threshold pinned to a tag nothing records under.
        let thresholds: Vec<ThresholdSpec> =
            vec!["iteration_duration{scenario:other}:p(99)<50".parse().unwrap()];
        let runtime = Runtime::new(config(load(10, 1, 1, 10), thresholds));

        let scenario = SleepScenario::success(Duration::from_millis(1));
        let report = runtime.run_with(move |_id| scenario.clone()).await;

        assert!(!report.passed());
        assert!(report.verdict.thresholds[0].is_insufficient_data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_is_fatal() {
        let runtime = Runtime::new(config(load(5, 1, 1, 5), Vec::new()));

        let report = runtime.run_with(|_id| PanicScenario).await;

        assert!(!report.passed());
        assert!(report.verdict.fatal.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_drains_early() {
        let runtime = Runtime::new(config(load(100, 10, 10, 10), Vec::new()));
        let cancel = runtime.cancel_handle();

        tokio::spawn(async move {
            time::sleep(Duration::from_millis(1505)).await;
            cancel.store(false, Ordering::SeqCst);
        });

        let scenario = SleepScenario::success(Duration::from_millis(1));
        let report = runtime.run_with(move |_id| scenario.clone()).await;

        // Cancelled about 1.5 s into a 10 s schedule: no new ticks, everything
        // in flight accounted for.
        assert!(report.attempts >= 140 && report.attempts <= 160);
        assert_eq!(report.iterations, report.attempts);
        assert!(report.passed());
    }
}
