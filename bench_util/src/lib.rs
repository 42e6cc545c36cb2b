//! Mod args
//!     CmdlineArgs: parse command line arguments and the optional JSON
//!     configuration overlay for the benchmark
//!
//! Mod rdtsc
//!     Calibrated cycle clock. Converts TSC deltas to wall-clock
//!     nanoseconds; calibrated once per process.
//!
//! Mod fabric
//!     Software datagram fabric exposing the queue-pair surface the
//!     benchmark engine drives: QP state machine, send/recv completion
//!     queues, immediate data. One UDP socket per queue pair.
//!
//! Mod thread_opt
//!     Best-effort CPU pinning and realtime priority for worker threads.

pub mod args;
pub mod fabric;
pub mod rdtsc;
pub mod thread_opt;

/// wr-id / immediate tag for untimed traffic
pub const MSG_REGULAR: u32 = 0xFFFF_FFFF;
/// wr-id / immediate tag for a graceful stop control message
pub const MSG_CTL_STOP: u32 = 0xFFFF_FFFE;

/// capacity of the connection registry
pub const MAX_CONN: usize = 20;

/// fixed 4-byte token exchanged as a per-QP handshake barrier
pub const SYNC_TOKEN: [u8; 4] = *b"sync";

/// global route header bytes reserved per datagram buffer slot
pub const GRH_SZ: u64 = 40;

#[inline]
pub fn round_up(num: u64, factor: i64) -> u64 {
    if factor == 0 {
        return num;
    }

    ((num + factor as u64 - 1) as i64 & (-factor)) as u64
}

#[cfg(test)]
mod tests {
    use super::round_up;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(16, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
        assert_eq!(round_up(7, 0), 7);
    }

    #[test]
    fn test_sentinels_distinct() {
        assert_ne!(super::MSG_REGULAR, super::MSG_CTL_STOP);
    }
}
