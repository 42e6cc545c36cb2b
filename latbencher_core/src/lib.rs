//! Core code for bootstrapping benchmark worker threads.
//!
//! A benchmark run is a set of role pools: each [`RolePool`] owns the OS
//! threads of one role (posting, send-polling, receive-polling, ...) and
//! every worker receives one immutable task value describing what it
//! drives. Workers return `Result<(), E>`; joining a pool aggregates every
//! failure into an overall run failure instead of aborting the process.
//!
//! The crate also provides the statistics side: workers mark progress on a
//! shared [`BenchStat`] and a [`SimpleBenchReporter`] periodically folds
//! those counters into a human-readable [`CollectedBenchStat`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use latbencher_core::{BenchStat, RolePool, RunFlag};
//!
//! let flag = RunFlag::new();
//! let stat = Arc::new(BenchStat::default());
//! let pool = {
//!     let (flag, stat) = (flag.clone(), stat.clone());
//!     RolePool::spawn("worker", vec![0usize, 1], move |task| {
//!         while flag.running() {
//!             stat.finished_one_op();
//!             let _ = task;
//!         }
//!         Ok::<(), std::io::Error>(())
//!     })
//! };
//! flag.stop();
//! pool.join().unwrap();
//! ```

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;
use thiserror::Error;

mod reporter;
pub use reporter::{BenchStat, CollectedBenchStat, SimpleBenchReporter};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{failed} of {total} {role} worker(s) exited with a failure")]
    WorkersFailed {
        role: String,
        failed: usize,
        total: usize,
    },
    #[error("a {role} worker panicked")]
    WorkerPanicked { role: String },
}

/// Shared cooperative stop flag. Cloned into workers; observed on their
/// next loop iteration with no guaranteed upper bound.
#[derive(Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The joinable threads of one worker role.
pub struct RolePool<E> {
    role: String,
    handles: Vec<JoinHandle<Result<(), E>>>,
}

impl<E: Display + Send + 'static> RolePool<E> {
    /// Spawn one worker per task. The body is cloned into each thread and
    /// receives its task by value.
    pub fn spawn<T, F>(role: &str, tasks: impl IntoIterator<Item = T>, body: F) -> Self
    where
        T: Send + 'static,
        F: Fn(T) -> Result<(), E> + Send + Sync + Clone + 'static,
    {
        let handles = tasks
            .into_iter()
            .map(|task| {
                let body = body.clone();
                std::thread::spawn(move || body(task))
            })
            .collect();
        Self {
            role: role.to_string(),
            handles,
        }
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every worker. Failures are logged per thread and folded into
    /// one error; joining never aborts early, so resources owned by other
    /// workers still get released.
    pub fn join(self) -> Result<(), RunnerError> {
        let total = self.handles.len();
        let mut failed = 0;
        for (idx, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    error!("{}[{}]: failed to execute: {}", self.role, idx, err);
                }
                Err(_) => {
                    return Err(RunnerError::WorkerPanicked {
                        role: self.role.clone(),
                    })
                }
            }
        }
        if failed > 0 {
            return Err(RunnerError::WorkersFailed {
                role: self.role,
                failed,
                total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_runs_every_task() {
        let stat = Arc::new(BenchStat::default());
        let pool = {
            let stat = stat.clone();
            RolePool::spawn("adder", 0..10u64, move |task| {
                stat.finished_batch_ops(task);
                Ok::<(), std::io::Error>(())
            })
        };
        assert_eq!(pool.len(), 10);
        pool.join().unwrap();
        assert_eq!(stat.num_ops_finished(), (0..10).sum::<u64>());
    }

    #[test]
    fn test_run_flag_stops_workers() {
        let flag = RunFlag::new();
        let pool = {
            let flag = flag.clone();
            RolePool::spawn("spinner", vec![(), ()], move |_| {
                while flag.running() {
                    std::thread::yield_now();
                }
                Ok::<(), std::io::Error>(())
            })
        };
        flag.stop();
        pool.join().unwrap();
    }

    #[test]
    fn test_join_aggregates_failures() {
        let pool = RolePool::spawn("flaky", vec![0usize, 1, 2], |task| {
            if task == 1 {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            } else {
                Ok(())
            }
        });
        match pool.join() {
            Err(RunnerError::WorkersFailed {
                failed, total, ..
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected join result: {:?}", other.err()),
        }
    }
}
