//! Burst pacing toward a target bitrate.
//!
//! The limiter converts a target bitrate into a per-burst gap measured in
//! processor cycles, then spin-waits on the cycle counter between bursts.
//! Spinning instead of sleeping keeps the gap accurate at microsecond
//! scale.

use log::info;

use bench_util::rdtsc::get_rdtsc;

/// cycles the posting path itself consumes per burst, credited against
/// the gap
const COMPUTATION_CYCLES: f64 = 2000.0;

/// Gap between bursts, in cycles, for a target bitrate.
///
/// packets/s = rate(Mbps) / message bits / posting threads, bursts/s =
/// packets/s / burst size, gap(us) = 1e6 / bursts/s, then scaled by the
/// calibrated frequency minus the fixed posting overhead.
pub fn calc_gap_cycle(
    rate_limit_mbps: u32,
    msg_size: u32,
    num_threads: u32,
    burst_size: u32,
    cpu_mhz: f64,
) -> u64 {
    let packet_per_second =
        (rate_limit_mbps as f64 * 1024.0 * 1024.0) / (msg_size as f64 * 8.0) / num_threads as f64;
    let number_of_bursts = packet_per_second / burst_size as f64;
    let gap_time = 1_000_000.0 / number_of_bursts;
    let gap_cycle = gap_time * cpu_mhz - COMPUTATION_CYCLES;

    info!(
        "Rate: {} Mbps, PPS: {:.1}, Bursts/s: {:.1}, Gap: {:.2} us ({} cycles)",
        rate_limit_mbps, packet_per_second, number_of_bursts, gap_time, gap_cycle as u64
    );
    gap_cycle as u64
}

/// Per-thread pacing state. With the limiter disabled every call to
/// [`BurstPacer::ready`] answers true and posting runs at full queue
/// depth.
pub struct BurstPacer {
    gap_cycle: u64,
    burst_size: u64,
    burst_iter: u64,
    gap_deadline: u64,
    sending_burst: bool,
    enabled: bool,
}

impl BurstPacer {
    pub fn new(enabled: bool, burst_size: u32, gap_cycle: u64) -> Self {
        Self {
            gap_cycle,
            burst_size: burst_size as u64,
            burst_iter: 0,
            gap_deadline: 0,
            sending_burst: true,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, 0)
    }

    /// Whether the next post may go out now. While inside a gap this
    /// reads the cycle counter and flips back to bursting once the
    /// deadline has passed.
    #[inline]
    pub fn ready(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        if !self.sending_burst && get_rdtsc() >= self.gap_deadline {
            self.sending_burst = true;
            self.burst_iter = 0;
        }
        self.sending_burst
    }

    /// Account one posted message; closing a burst arms the deadline.
    #[inline]
    pub fn on_post(&mut self) {
        if !self.enabled {
            return;
        }
        self.burst_iter += 1;
        if self.burst_iter >= self.burst_size {
            self.burst_iter = 0;
            self.sending_burst = false;
            self.gap_deadline = get_rdtsc().saturating_add(self.gap_cycle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_cycle_formula() {
        // 1000 Mbps, 1024-byte messages, 1 thread, bursts of 10, 2000 MHz:
        // pps = 131072, bursts/s = 13107.2, gap = 76.2939... us,
        // cycles = 76.2939 * 2000 - 2000
        assert_eq!(calc_gap_cycle(1000, 1024, 1, 10, 2000.0), 150_587);
    }

    #[test]
    fn test_gap_scales_with_threads() {
        let one = calc_gap_cycle(1000, 1024, 1, 10, 2000.0);
        let two = calc_gap_cycle(1000, 1024, 2, 10, 2000.0);
        // half the per-thread packet rate means roughly double the gap
        assert!(two > one);
    }

    #[test]
    fn test_disabled_pacer_always_ready() {
        let mut pacer = BurstPacer::disabled();
        for _ in 0..1000 {
            assert!(pacer.ready());
            pacer.on_post();
        }
    }

    #[test]
    fn test_extreme_gap_saturates_deadline() {
        // a degenerate configuration can yield an enormous gap; arming the
        // deadline must saturate instead of wrapping past the counter
        let mut pacer = BurstPacer::new(true, 1, u64::MAX);
        assert!(pacer.ready());
        pacer.on_post();
        assert!(!pacer.ready());
        assert_eq!(pacer.gap_deadline, u64::MAX);
    }

    #[test]
    fn test_pacer_closes_burst_and_reopens() {
        // tiny gap so the test does not spin for long
        let mut pacer = BurstPacer::new(true, 4, 10);
        for _ in 0..4 {
            assert!(pacer.ready());
            pacer.on_post();
        }
        // gap armed after a full burst
        assert!(!pacer.sending_burst);
        while !pacer.ready() {
            std::hint::spin_loop();
        }
        assert!(pacer.ready());
    }
}
