//! Running scheduler phases on a worker pool.

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{UniverseError, UniverseResult};

/// Runs each phase's units concurrently on a fixed-size pool. Phases run
/// strictly in order, and the first failure in a phase stops the units of
/// that phase that have not started yet.
pub struct PhaseExecutor {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl PhaseExecutor {
    pub fn new(workers: usize) -> UniverseResult<Self> {
        if workers == 0 {
            return Err(UniverseError::validation("worker count must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ccr-worker-{}", i))
            .build()
            .map_err(|e| UniverseError::generation(format!("starting worker pool: {}", e)))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Call `work(phase_index, unit)` for every unit. Returns the first
    /// error encountered.
    pub fn run<T, F>(&self, phases: &[Vec<T>], work: F) -> UniverseResult<()>
    where
        T: Sync,
        F: Fn(usize, &T) -> UniverseResult<()> + Sync,
    {
        for (index, phase) in phases.iter().enumerate() {
            let start = Instant::now();
            info!(phase = index + 1, units = phase.len(), "starting phase");
            let cancelled = AtomicBool::new(false);
            self.pool.install(|| {
                phase.par_iter().try_for_each(|unit| {
                    if cancelled.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    work(index, unit).map_err(|e| {
                        cancelled.store(true, Ordering::SeqCst);
                        e
                    })
                })
            })?;
            debug!(
                phase = index + 1,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "phase complete"
            );
        }
        Ok(())
    }
}
