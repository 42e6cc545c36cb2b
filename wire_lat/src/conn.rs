//! Connections and the fixed-capacity registry that owns them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bench_util::args::CmdlineArgs;
use bench_util::fabric::{Device, QueuePair};
use bench_util::rdtsc::Timespec;
use bench_util::{round_up, GRH_SZ, MAX_CONN};

use crate::BenchError;

/// Work-request accounting for one queue pair. Each counter is only ever
/// incremented by one worker role, so a plain atomic add is all the
/// synchronization the flow-control arithmetic needs.
#[derive(Debug, Default)]
#[repr(align(128))]
pub struct QpCounters {
    pub posted_wr: AtomicU64,
    pub completed_wr: AtomicU64,
    pub recv_posted_wr: AtomicU64,
    pub recv_completed_wr: AtomicU64,
}

impl QpCounters {
    /// Send work requests currently in flight.
    pub fn inflight_send(&self) -> u64 {
        self.posted_wr
            .load(Ordering::Relaxed)
            .saturating_sub(self.completed_wr.load(Ordering::Relaxed))
    }

    /// Receive work requests currently outstanding.
    pub fn inflight_recv(&self) -> u64 {
        self.recv_posted_wr
            .load(Ordering::Relaxed)
            .saturating_sub(self.recv_completed_wr.load(Ordering::Relaxed))
    }
}

/// One benchmark connection: its queue pairs, their buffers and counters,
/// and the sample-timestamp arrays the latency sampler fills in.
///
/// Loopback connections are plain `Connection`s that only ever carry the
/// local-latency measurement; they exist in wired-together pairs and
/// never face the remote peer.
pub struct Connection {
    qps: Vec<Arc<QueuePair>>,
    counters: Vec<QpCounters>,
    buffers: Vec<Vec<u8>>,

    /// sampled post timestamps, nanoseconds; slot i belongs to sample i
    samples_start: Vec<AtomicU64>,
    /// matching completion timestamps
    samples_end: Vec<AtomicU64>,
    /// next free sample slot, shared by every posting thread of this
    /// connection so two threads can never claim the same slot
    sample_seq: AtomicU64,
    samples_count: AtomicU64,

    polling: AtomicBool,
}

impl Connection {
    /// Provision the queue pairs and buffers of one connection. Sample
    /// arrays are only allocated where a sampler will run (the client's
    /// primary and first-loopback connections).
    pub fn new(
        device: &Device,
        args: &CmdlineArgs,
        with_samples: bool,
    ) -> Result<Self, BenchError> {
        let mut qps = Vec::with_capacity(args.qps as usize);
        let mut counters = Vec::with_capacity(args.qps as usize);
        let mut buffers = Vec::with_capacity(args.qps as usize);
        // buffers are page-aligned in size, like a registered region
        let buf_size = round_up(
            (args.msg_size as u64 + GRH_SZ) * args.rx_depth.max(args.tx_depth) as u64,
            4096,
        );
        for _ in 0..args.qps {
            qps.push(device.create_qp(args.qp_type, args.tx_depth, args.rx_depth)?);
            counters.push(QpCounters::default());
            buffers.push(vec![0u8; buf_size as usize]);
        }

        let max_samples = if with_samples { args.max_samples() } else { 0 };
        let mut samples_start = Vec::with_capacity(max_samples);
        let mut samples_end = Vec::with_capacity(max_samples);
        samples_start.resize_with(max_samples, AtomicU64::default);
        samples_end.resize_with(max_samples, AtomicU64::default);

        Ok(Self {
            qps,
            counters,
            buffers,
            samples_start,
            samples_end,
            sample_seq: AtomicU64::new(0),
            samples_count: AtomicU64::new(0),
            polling: AtomicBool::new(true),
        })
    }

    pub fn num_qps(&self) -> usize {
        self.qps.len()
    }

    pub fn qp(&self, qp_idx: usize) -> &Arc<QueuePair> {
        &self.qps[qp_idx]
    }

    pub fn counters(&self, qp_idx: usize) -> &QpCounters {
        &self.counters[qp_idx]
    }

    /// Message payload for one queue pair; the send side reads from the
    /// front of the registered buffer.
    pub fn payload(&self, qp_idx: usize, msg_size: u32) -> &[u8] {
        &self.buffers[qp_idx][..msg_size as usize]
    }

    #[inline]
    pub fn polling(&self) -> bool {
        self.polling.load(Ordering::Relaxed)
    }

    pub fn stop_polling(&self) {
        self.polling.store(false, Ordering::SeqCst);
    }

    pub fn max_samples(&self) -> usize {
        self.samples_start.len()
    }

    /// Claim the next sample slot. Returns `None` once the arrays are
    /// exhausted; the caller falls back to an untimed post.
    pub fn next_sample_seq(&self) -> Option<u64> {
        let seq = self.sample_seq.fetch_add(1, Ordering::Relaxed);
        if (seq as usize) < self.samples_start.len() {
            self.samples_count.fetch_add(1, Ordering::Relaxed);
            Some(seq)
        } else {
            None
        }
    }

    pub fn samples_count(&self) -> u64 {
        self.samples_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn record_sample_start(&self, seq: u64, ts: Timespec) {
        self.samples_start[seq as usize].store(ts.as_nanos(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_end(&self, seq: u64, ts: Timespec) {
        if (seq as usize) < self.samples_end.len() {
            self.samples_end[seq as usize].store(ts.as_nanos(), Ordering::Relaxed);
        }
    }

    pub fn sample_start_ns(&self, seq: usize) -> u64 {
        self.samples_start[seq].load(Ordering::Relaxed)
    }

    pub fn sample_end_ns(&self, seq: usize) -> u64 {
        self.samples_end[seq].load(Ordering::Relaxed)
    }
}

/// Fixed-capacity arena of connections addressed by integer index. An
/// index stays valid for the whole run; removal leaves a hole rather than
/// shifting later entries.
pub struct Registry {
    slots: Mutex<Vec<Option<Arc<Connection>>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CONN);
        slots.resize_with(MAX_CONN, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Place a connection in the first free slot and return its index.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<usize, BenchError> {
        let mut slots = self.slots.lock().unwrap();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(conn);
                return Ok(idx);
            }
        }
        Err(BenchError::RegistryFull)
    }

    pub fn get(&self, idx: usize) -> Result<Arc<Connection>, BenchError> {
        self.slots
            .lock()
            .unwrap()
            .get(idx)
            .and_then(|slot| slot.clone())
            .ok_or(BenchError::ConnectionMissing(idx))
    }

    /// Release a slot. The connection's resources go away once the last
    /// worker holding it exits.
    pub fn remove(&self, idx: usize) -> Option<Arc<Connection>> {
        self.slots.lock().unwrap().get_mut(idx).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_util::rdtsc::Timespec;
    use clap::Parser;

    fn test_args() -> CmdlineArgs {
        let mut args = CmdlineArgs::parse_from([
            "wire_lat",
            "--iterations",
            "1000",
            "--sampling-ratio",
            "0.1",
            "--qps",
            "2",
        ]);
        args.coordinate().unwrap();
        args
    }

    fn test_conn(with_samples: bool) -> Connection {
        let device = Device::open("127.0.0.1".parse().unwrap());
        Connection::new(&device, &test_args(), with_samples).unwrap()
    }

    #[test]
    fn test_connection_layout() {
        let conn = test_conn(true);
        assert_eq!(conn.num_qps(), 2);
        assert_eq!(conn.max_samples(), 150);
        assert!(conn.polling());
    }

    #[test]
    fn test_sample_seq_dense_and_bounded() {
        let conn = test_conn(true);
        let cap = conn.max_samples() as u64;
        for expect in 0..cap {
            assert_eq!(conn.next_sample_seq(), Some(expect));
        }
        // the arrays are never overrun
        assert_eq!(conn.next_sample_seq(), None);
        assert_eq!(conn.samples_count(), cap);
    }

    #[test]
    fn test_sample_slots_pair_up() {
        let conn = test_conn(true);
        let seq = conn.next_sample_seq().unwrap();
        conn.record_sample_start(seq, Timespec::from_nanos(100));
        conn.record_sample_end(seq, Timespec::from_nanos(5_100));
        assert_eq!(
            conn.sample_end_ns(seq as usize) - conn.sample_start_ns(seq as usize),
            5_000
        );
    }

    #[test]
    fn test_inflight_accounting() {
        let conn = test_conn(false);
        let counters = conn.counters(0);
        counters.posted_wr.fetch_add(10, Ordering::Relaxed);
        counters.completed_wr.fetch_add(4, Ordering::Relaxed);
        assert_eq!(counters.inflight_send(), 6);
        assert_eq!(counters.inflight_recv(), 0);
    }

    #[test]
    fn test_registry_index_stability() {
        let registry = Registry::new();
        let a = registry.insert(Arc::new(test_conn(false))).unwrap();
        let b = registry.insert(Arc::new(test_conn(false))).unwrap();
        assert_eq!((a, b), (0, 1));

        registry.remove(a);
        assert!(registry.get(a).is_err());
        // slot b keeps its index after a is removed
        assert!(registry.get(b).is_ok());
        // freed slot is reused
        assert_eq!(registry.insert(Arc::new(test_conn(false))).unwrap(), 0);
    }

    #[test]
    fn test_registry_bounded() {
        let registry = Registry::new();
        for _ in 0..MAX_CONN {
            registry.insert(Arc::new(test_conn(false))).unwrap();
        }
        assert!(matches!(
            registry.insert(Arc::new(test_conn(false))),
            Err(BenchError::RegistryFull)
        ));
    }
}
