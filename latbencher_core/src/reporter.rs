//! Worker statistics and the periodic reporter that folds them into a
//! user-readable form.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_derive::{Deserialize, Serialize};

/// Progress counters one worker updates while running. Padded so two
/// workers' stats never share a cache line.
#[derive(Debug, Default)]
#[repr(align(128))]
pub struct BenchStat {
    num_ops_finished: AtomicU64,
}

impl BenchStat {
    /// Mark the stat that one op is finished
    pub fn finished_one_op(&self) {
        self.finished_batch_ops(1);
    }

    /// Mark the stat that a batch of ops are finished
    pub fn finished_batch_ops(&self, num_ops: u64) {
        self.num_ops_finished.fetch_add(num_ops, Ordering::Relaxed);
    }

    pub fn num_ops_finished(&self) -> u64 {
        self.num_ops_finished.load(Ordering::Relaxed)
    }
}

/// A collection of worker stats folded into what a run report cares
/// about: throughput over the last period and the implied average latency.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CollectedBenchStat {
    /// Throughput over the period, Mops/s
    pub throughput: f64,
    /// Average per-op latency over the period, microseconds
    pub avg_latency: f64,
    /// The id of the stats
    pub id: usize,
}

/// Collects the results of workers on one machine and reports the delta
/// since the previous call.
#[derive(Debug)]
pub struct SimpleBenchReporter {
    ops_of_last_period: u64,
    last_record_time: Instant,
    id: usize,
}

impl Default for SimpleBenchReporter {
    fn default() -> Self {
        Self {
            ops_of_last_period: 0,
            last_record_time: Instant::now(),
            id: 0,
        }
    }
}

impl SimpleBenchReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_id(id: usize) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Fold the current worker counters into a period report.
    pub fn report_collected_stat(&mut self, stats: &[Arc<BenchStat>]) -> CollectedBenchStat {
        let total: u64 = stats.iter().map(|s| s.num_ops_finished()).sum();
        let now = Instant::now();
        let gap = total - self.ops_of_last_period;

        // microseconds passed
        let duration = now.duration_since(self.last_record_time).as_micros() as f64;
        let throughput = gap as f64 / duration;
        let avg_latency = duration / gap as f64;

        self.ops_of_last_period = total;
        self.last_record_time = now;

        CollectedBenchStat {
            id: self.id,
            throughput,
            avg_latency,
        }
    }
}

impl std::fmt::Display for CollectedBenchStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "@{} Throughput: {:.4} Mops/s, Avg Latency: {:.2} us",
            self.id, self.throughput, self.avg_latency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_accumulates() {
        let stat = BenchStat::default();
        stat.finished_one_op();
        stat.finished_batch_ops(9);
        assert_eq!(stat.num_ops_finished(), 10);
    }

    #[test]
    fn test_reporter_reports_period_delta() {
        let stats = vec![Arc::new(BenchStat::default()), Arc::new(BenchStat::default())];
        let mut reporter = SimpleBenchReporter::new_with_id(7);

        stats[0].finished_batch_ops(500);
        stats[1].finished_batch_ops(500);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let first = reporter.report_collected_stat(&stats);
        assert_eq!(first.id, 7);
        assert!(first.throughput > 0.0);

        // no progress since the last period
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = reporter.report_collected_stat(&stats);
        assert_eq!(second.throughput, 0.0);
    }
}
