use core::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::sync::Arc;

use tokio::time::Instant;

pub mod cfg;
pub mod cmd;
pub mod logging;
pub mod report;
pub mod runtime;
pub mod scenario;
mod scheduler;
pub mod stat;
pub mod threshold;
mod worker;

/// Thread-safe producing iterators.
///
/// Unlike the [`Iterator`] this trait accepts `self` by reference and returns a
/// reference to the next item, not an [`Option`].
///
/// Think of it as an infinite thread-safe iterator.
trait Produce {
    /// The type of the elements being produced.
    type Item: ?Sized;

    /// Advances this producer and returns the next value.
    fn next(&self) -> &Self::Item;
}

/// Thread-safe infinite cycle producing iterator over the given vector.
#[derive(Debug)]
pub struct VecProduce<T> {
    vec: Vec<T>,
    idx: AtomicUsize,
}

impl<T> VecProduce<T> {
    /// Constructs a new [`VecProduce`] from the given vector.
    ///
    /// The vector must be non-empty.
    #[inline]
    pub const fn new(vec: Vec<T>) -> Self {
        Self { vec, idx: AtomicUsize::new(0) }
    }
}

impl<T> Produce for Arc<VecProduce<T>> {
    type Item = T;

    #[inline]
    fn next(&self) -> &Self::Item {
        // Increment the current value, returning the previous one.
        let idx = self.idx.fetch_add(1, Ordering::Relaxed);
        let idx = idx % self.vec.len();

        &self.vec[idx]
    }
}

/// Monotonic run clock.
///
/// Started exactly once when a run enters the running state. Copies share the
/// same epoch, so every component measures offsets against the same instant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    started_at: Instant,
}

impl Clock {
    #[inline]
    pub fn start() -> Self {
        Self { started_at: Instant::now() }
    }

    /// The instant this run started.
    #[inline]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time elapsed since run start.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
