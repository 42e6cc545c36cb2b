//! Calibrated cycle clock.
//!
//! The hardware cycle counter is calibrated against the monotonic wall
//! clock exactly once per process; afterwards every timestamp is a cheap
//! counter read scaled by the stored ticks-per-nanosecond ratio.

use std::sync::OnceLock;

use log::info;
use thiserror::Error;

use crate::thread_opt;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// iterations of the calibration busy loop
const CALIBRATION_SPINS: u64 = 100_000_000;

static TICKS_PER_NS: OnceLock<f64> = OnceLock::new();

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("ticks-per-ns ratio must be positive, got {0}")]
    NonPositiveRatio(f64),
    #[error("cycle clock already initialized")]
    AlreadyInitialized,
}

/// Read the free-running cycle counter.
#[inline]
pub fn get_rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let cnt: u64;
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt);
        cnt
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        monotonic_nanos()
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn monotonic_nanos() -> u64 {
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// A cycle-counter reading converted to wall-clock form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timespec {
    pub secs: u64,
    pub nanos: u32,
}

impl Timespec {
    pub fn from_nanos(total: u64) -> Self {
        Self {
            secs: total / NANOS_PER_SEC,
            nanos: (total % NANOS_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.secs * NANOS_PER_SEC + self.nanos as u64
    }
}

/// Time the cycle counter against the monotonic clock around a fixed
/// CPU-bound loop. Pins the calling thread for the duration of the
/// measurement so the counter reads come from one core.
fn calibrate() -> f64 {
    info!("Calibrating cycle counter, this takes a moment...");
    // pinning failure downgrades the calibration, it does not abort it
    let _ = thread_opt::set_affinity(1);

    let begin_wall = std::time::Instant::now();
    let begin = get_rdtsc();
    for i in 0..CALIBRATION_SPINS {
        std::hint::black_box(i);
    }
    let end = get_rdtsc();
    let ns_elapsed = begin_wall.elapsed().as_nanos() as u64;

    let ticks_per_ns = (end - begin) as f64 / ns_elapsed as f64;
    info!("Cycle counter calibrated: {:.2} ticks/ns", ticks_per_ns);
    ticks_per_ns
}

/// Initialize the clock, either self-calibrating or with a ratio supplied
/// by the caller. Must run before worker threads start reading time; a
/// non-positive supplied ratio is a fatal configuration error.
pub fn init_rdtsc(auto_calibration: bool, ticks_per_ns: f64) -> Result<(), ClockError> {
    let value = if auto_calibration {
        calibrate()
    } else {
        if ticks_per_ns <= 0.0 {
            return Err(ClockError::NonPositiveRatio(ticks_per_ns));
        }
        ticks_per_ns
    };
    TICKS_PER_NS
        .set(value)
        .map_err(|_| ClockError::AlreadyInitialized)
}

#[inline]
fn ticks_per_ns() -> f64 {
    *TICKS_PER_NS.get_or_init(calibrate)
}

/// Current cycle count converted to a wall-clock timestamp.
#[inline]
pub fn get_rdtsc_timespec() -> Timespec {
    Timespec::from_nanos((get_rdtsc() as f64 / ticks_per_ns()) as u64)
}

/// Calibrated processor frequency in MHz.
pub fn cpu_mhz() -> f64 {
    ticks_per_ns() * 1000.0
}

/// Duration in nanoseconds; the caller guarantees `end >= start`.
#[inline]
pub fn time_diff_in_ns(end: Timespec, start: Timespec) -> u64 {
    end.as_nanos().saturating_sub(start.as_nanos())
}

pub fn time_elapsed_in_us(start: Timespec) -> f64 {
    time_diff_in_ns(get_rdtsc_timespec(), start) as f64 / 1_000.0
}

pub fn time_elapsed_in_sec(start: Timespec) -> f64 {
    time_diff_in_ns(get_rdtsc_timespec(), start) as f64 / NANOS_PER_SEC as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_ratio() {
        assert!(matches!(
            init_rdtsc(false, 0.0),
            Err(ClockError::NonPositiveRatio(_))
        ));
        assert!(matches!(
            init_rdtsc(false, -2.2),
            Err(ClockError::NonPositiveRatio(_))
        ));
    }

    #[test]
    fn test_timespec_roundtrip() {
        let ts = Timespec::from_nanos(3 * NANOS_PER_SEC + 42);
        assert_eq!(ts.secs, 3);
        assert_eq!(ts.nanos, 42);
        assert_eq!(ts.as_nanos(), 3 * NANOS_PER_SEC + 42);
    }

    #[test]
    fn test_diff_in_ns() {
        let start = Timespec::from_nanos(1_000);
        let end = Timespec::from_nanos(6_000);
        assert_eq!(time_diff_in_ns(end, start), 5_000);
    }

    #[test]
    fn test_counter_monotonic() {
        let a = get_rdtsc();
        let b = get_rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_timestamps_advance() {
        let a = get_rdtsc_timespec();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = get_rdtsc_timespec();
        assert!(time_diff_in_ns(b, a) > 1_000_000);
    }
}
