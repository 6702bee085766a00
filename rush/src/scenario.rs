use core::future::Future;

use crate::stat::Outcome;

pub mod http;

/// Per-iteration context handed to the scenario by the engine.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Sequence number of the tick that dispatched this iteration.
    pub seq: u64,
}

/// One scenario iteration: build a request, perform it, check the response.
///
/// The engine is agnostic to what an iteration does. It invokes the scenario
/// once per dispatched tick, measures the wall-clock duration around the call
/// and interprets only the returned [`Outcome`]. Failures stay inside the
/// scenario and come back as data, never as panics or errors.
///
/// A scenario instance belongs to exactly one worker, so iterations of the
/// same instance run strictly sequentially and may keep state between them,
/// such as an open connection.
pub trait Scenario: Send {
    fn execute(&mut self, ctx: &Context) -> impl Future<Output = Outcome> + Send;
}

#[cfg(test)]
pub mod testing {
    use core::time::Duration;

    use super::{Context, Scenario};
    use crate::stat::Outcome;

    /// Deterministic scenario: sleeps for a fixed latency, then returns a
    /// fixed outcome. Meant for virtual-time tests.
    #[derive(Debug, Clone)]
    pub struct SleepScenario {
        latency: Duration,
        outcome: Outcome,
    }

    impl SleepScenario {
        pub fn new(latency: Duration, outcome: Outcome) -> Self {
            Self { latency, outcome }
        }

        pub fn success(latency: Duration) -> Self {
            Self::new(latency, Outcome::Success)
        }
    }

    impl Scenario for SleepScenario {
        async fn execute(&mut self, _ctx: &Context) -> Outcome {
            tokio::time::sleep(self.latency).await;
            self.outcome
        }
    }

    /// Scenario that panics on execution, for fatal-error paths.
    #[derive(Debug, Clone)]
    pub struct PanicScenario;

    impl Scenario for PanicScenario {
        async fn execute(&mut self, _ctx: &Context) -> Outcome {
            panic!("scenario blew up");
        }
    }
}
