//! Timing thread priority
//!
//! Raises the calling thread above normal scheduling so position ticks keep
//! their cadence under load. Failure is non-fatal: the thread keeps running
//! at default priority.
//!
//! - **macOS**: QoS class USER_INTERACTIVE
//! - **Linux**: SCHED_FIFO, then SCHED_RR (needs CAP_SYS_NICE or an rtprio limit)
//!
//! Priorities stay below what an audio callback thread would take.

use std::cell::Cell;

thread_local! {
    static ELEVATED: Cell<bool> = const { Cell::new(false) };
}

/// Result of a priority elevation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    /// Elevated
    Success,
    /// This thread was already elevated
    AlreadySet,
    /// Refused by the OS, default priority kept
    Failed,
    Unsupported,
}

impl PriorityResult {
    pub fn is_elevated(self) -> bool {
        matches!(self, Self::Success | Self::AlreadySet)
    }
}

/// Elevate the current thread. Only the first successful call per thread
/// touches the scheduler.
pub fn elevate_timing_thread() -> PriorityResult {
    if ELEVATED.with(Cell::get) {
        return PriorityResult::AlreadySet;
    }

    let result = platform_elevate();
    let name = std::thread::current().name().unwrap_or("unnamed").to_string();
    match result {
        PriorityResult::Success => {
            ELEVATED.with(|e| e.set(true));
            log::info!("[Priority] '{}' elevated", name);
        }
        PriorityResult::Failed => {
            log::warn!("[Priority] Could not elevate '{}' (non-fatal)", name);
        }
        PriorityResult::Unsupported => {
            log::debug!("[Priority] Elevation not supported on this platform");
        }
        PriorityResult::AlreadySet => {}
    }
    result
}

// ═══════════════════════════════════════════════════════════════════════════════
// macOS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "macos")]
fn platform_elevate() -> PriorityResult {
    const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;

    unsafe extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
    }

    let result = unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0) };
    if result == 0 {
        PriorityResult::Success
    } else {
        log::debug!("[Priority] pthread_set_qos_class_self_np failed: {}", result);
        PriorityResult::Failed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Linux
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "linux")]
fn platform_elevate() -> PriorityResult {
    use libc::{SCHED_FIFO, SCHED_RR, pthread_self, pthread_setschedparam, sched_param};

    // pid 0 targets the calling thread
    let mut param = sched_param { sched_priority: 40 };
    if unsafe { libc::sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return PriorityResult::Success;
    }
    log::debug!("[Priority] SCHED_FIFO refused, trying SCHED_RR");

    param.sched_priority = 30;
    if unsafe { libc::sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return PriorityResult::Success;
    }
    log::debug!("[Priority] SCHED_RR refused, trying pthread_setschedparam");

    param.sched_priority = 20;
    let result = unsafe { pthread_setschedparam(pthread_self(), SCHED_FIFO, &param) };
    if result == 0 {
        PriorityResult::Success
    } else {
        log::debug!("[Priority] All RT scheduling methods refused (errno: {})", result);
        PriorityResult::Failed
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn platform_elevate() -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_elevation_is_per_thread_and_idempotent() {
        // Fresh thread so the test runner's own scheduling is untouched
        let (first, second) = thread::spawn(|| (elevate_timing_thread(), elevate_timing_thread()))
            .join()
            .unwrap();

        assert_ne!(first, PriorityResult::AlreadySet);
        if first == PriorityResult::Success {
            assert_eq!(second, PriorityResult::AlreadySet);
            assert!(second.is_elevated());
        } else {
            assert_eq!(second, first);
            assert!(!second.is_elevated());
        }

        // Another thread starts unelevated
        let other = thread::spawn(elevate_timing_thread).join().unwrap();
        assert_ne!(other, PriorityResult::AlreadySet);
    }
}
