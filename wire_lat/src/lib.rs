//! Wire-latency micro-benchmark with loopback differencing.
//!
//! A client floods a server with tagged datagrams while posting an
//! equivalent send on a colocated loopback queue-pair pair for every
//! sampled operation. Subtracting the loopback duration from the wire
//! duration removes the local stack overhead common to both paths,
//! leaving network transit time.

pub mod client;
pub mod collector;
pub mod conn;
pub mod handshake;
pub mod rate;
pub mod server;

use bench_util::args::ConfigError;
use bench_util::fabric::FabricError;
use bench_util::rdtsc::ClockError;
use latbencher_core::RunnerError;
use thiserror::Error;

/// Identifies one worker: which thread it is and which registry slot it
/// drives. Immutable after creation, handed to the worker once.
#[derive(Clone, Copy, Debug)]
pub struct ThreadTask {
    pub thread_id: usize,
    pub conn_idx: usize,
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection registry is full")]
    RegistryFull,
    #[error("no connection in registry slot {0}")]
    ConnectionMissing(usize),
    #[error("thread[{thread_id}]: completion failed with status {status}")]
    CompletionStatus { thread_id: usize, status: u32 },
    #[error("handshake sync token mismatch")]
    SyncTokenMismatch,
}
