//! Best-effort worker-thread tuning: CPU pinning and SCHED_FIFO priority.
//! Both are optimizations; failing to apply one is a warning, never an
//! abort.

use std::io;

use log::warn;

/// Pin the calling thread to one CPU.
pub fn set_affinity(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut cpu_set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Give the calling thread the maximum SCHED_FIFO priority.
pub fn set_priority_max() -> io::Result<()> {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param {
            sched_priority: max,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Apply the per-thread tuning a worker asks for. Realtime priority is
/// opt-in; pinning always happens, keyed by the worker's thread id.
pub fn optimize_thread(thread_id: usize, realtime: bool) {
    if realtime {
        if let Err(err) = set_priority_max() {
            warn!("thread[{}]: failed to set realtime priority: {}", thread_id, err);
        }
    }
    if let Err(err) = set_affinity(thread_id) {
        warn!("thread[{}]: failed to set affinity: {}", thread_id, err);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_optimize_never_panics() {
        // priority setting usually fails without CAP_SYS_NICE; that must
        // stay a warning
        super::optimize_thread(0, true);
        super::optimize_thread(1, false);
    }
}
