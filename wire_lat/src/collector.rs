//! Post-run reduction of raw timestamp pairs into latency percentiles
//! and the CSV artifacts.

use std::fs::File;
use std::io::{BufWriter, Write};

use log::info;

use crate::conn::Connection;
use crate::BenchError;

/// Latency figures of one run, nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencySummary {
    pub average: f64,
    pub p50: f64,
    pub p99: f64,
    pub p999: f64,
    pub p9999: f64,
    /// samples with positive isolated latency
    pub counted: u64,
    /// all samples taken, including excluded ones
    pub total: u64,
}

/// Isolated wire latency of one sample: the loopback path measures the
/// local stack overhead shared by both posts, so subtracting it leaves
/// network transit time.
#[inline]
pub fn isolated_latency_ns(
    primary_start: u64,
    primary_end: u64,
    loopback_start: u64,
    loopback_end: u64,
) -> f64 {
    let wire = primary_end as f64 - primary_start as f64;
    let local = loopback_end as f64 - loopback_start as f64;
    wire - local
}

/// Nearest-rank percentile on an ascending slice: index `floor(q * n)`,
/// zero-based, no interpolation.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[rank]
}

/// Pair up the timestamps of a primary connection and its loopback
/// counterpart, dump both CSVs, and reduce the positive isolated
/// latencies to summary figures.
///
/// Every sample lands in `<output>_raw`; only samples whose isolated
/// latency is positive land in `<output>` and in the percentile set. A
/// non-positive value means clock noise or mis-ordering, not a real
/// negative transit time.
pub fn collect_and_dump(
    primary: &Connection,
    loopback: &Connection,
    output: &str,
) -> Result<LatencySummary, BenchError> {
    let total = primary.samples_count();

    let mut histogram = BufWriter::new(File::create(output)?);
    let mut histogram_raw = BufWriter::new(File::create(format!("{}_raw", output))?);

    let mut filtered = Vec::with_capacity(total as usize);
    let mut sum = 0.0;
    for j in 0..total as usize {
        let lat1 = primary.sample_end_ns(j) as f64 - primary.sample_start_ns(j) as f64;
        let lat2 = loopback.sample_end_ns(j) as f64 - loopback.sample_start_ns(j) as f64;
        let on_wire_us = lat1 / 1000.0;
        let loopback_us = lat2 / 1000.0;
        let isolated = lat1 - lat2;

        writeln!(
            histogram_raw,
            "{},{:.1},{:.1},{}",
            j, on_wire_us, loopback_us, isolated
        )?;
        if isolated > 0.0 {
            sum += isolated;
            filtered.push(isolated);
            writeln!(
                histogram,
                "{},{:.1},{:.1},{}",
                j, on_wire_us, loopback_us, isolated
            )?;
        } else {
            info!("Latency equal or less than zero {}: {}", j, isolated);
        }
    }
    histogram.flush()?;
    histogram_raw.flush()?;

    filtered.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let counted = filtered.len() as u64;
    let summary = LatencySummary {
        average: if counted > 0 { sum / counted as f64 } else { 0.0 },
        p50: percentile(&filtered, 0.5),
        p99: percentile(&filtered, 0.99),
        p999: percentile(&filtered, 0.999),
        p9999: percentile(&filtered, 0.9999),
        counted,
        total,
    };

    info!("Average Latency: {}ns", summary.average);
    info!("50th    Latency: {}ns", summary.p50);
    info!("99th    Latency: {}ns", summary.p99);
    info!("99.9th  Latency: {}ns", summary.p999);
    info!("99.99th Latency: {}ns", summary.p9999);
    Ok(summary)
}

/// Posting-side throughput in Mops/s for a duration given in
/// microseconds.
pub fn throughput_mops(ops_count: u64, duration_us: f64) -> f64 {
    ops_count as f64 / duration_us
}

/// Bandwidth in Gb/s for a message size in bytes and duration in
/// microseconds.
pub fn bandwidth_gbps(ops_count: u64, msg_size: u32, duration_us: f64) -> f64 {
    (ops_count as f64 * msg_size as f64 * 8.0)
        / ((duration_us / 1_000_000.0) * (1024.0 * 1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_percentiles() {
        let lats = [10.0, 20.0, 30.0, 40.0, 50.0];
        // rank floor(0.5 * 5) = 2, zero-indexed
        assert_eq!(percentile(&lats, 0.5), 30.0);
        assert_eq!(percentile(&lats, 0.99), 50.0);
        assert_eq!(percentile(&lats, 0.9999), 50.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_isolation_arithmetic() {
        assert_eq!(isolated_latency_ns(0, 5_000, 0, 1_200), 3_800.0);
        // loopback longer than the wire path yields a negative value
        assert!(isolated_latency_ns(0, 1_000, 0, 1_500) < 0.0);
    }

    #[test]
    fn test_throughput_and_bandwidth() {
        // 1M ops in one second
        assert_eq!(throughput_mops(1_000_000, 1_000_000.0), 1.0);
        let bw = bandwidth_gbps(1_000_000, 1024, 1_000_000.0);
        assert!((bw - 1024.0 * 8.0 * 1_000_000.0 / (1024.0 * 1024.0 * 1024.0)).abs() < 1e-9);
    }
}
