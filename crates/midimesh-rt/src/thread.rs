//! Thread hygiene for the real-time transport worker.
//!
//! Promotion to a real-time scheduling class and memory locking are both
//! best-effort: an unprivileged process keeps running at normal priority.

/// Promote the current thread to SCHED_FIFO.
///
/// Returns `Ok` when the promotion applied or was not permitted (EPERM);
/// running unprivileged is acceptable. Non-Linux targets are a no-op.
#[cfg(target_os = "linux")]
pub fn promote_to_realtime(priority: i32) -> std::io::Result<()> {
    use libc::{sched_param, sched_setscheduler, SCHED_FIFO};

    let param = sched_param {
        sched_priority: priority.clamp(1, 99),
    };
    // SAFETY: plain syscall on the current thread with a valid param struct.
    let rc = unsafe { sched_setscheduler(0, SCHED_FIFO, &param) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// No-op on targets without SCHED_FIFO.
#[cfg(not(target_os = "linux"))]
pub fn promote_to_realtime(_priority: i32) -> std::io::Result<()> {
    Ok(())
}

/// Pin the process address space into RAM to avoid major page faults on the
/// real-time path. Insufficient permissions are treated as success.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> std::io::Result<()> {
    // SAFETY: mlockall takes only flag bits and affects the whole process.
    unsafe {
        let flags = libc::MCL_CURRENT | libc::MCL_FUTURE;
        if libc::mlockall(flags) != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Ok(());
            }
            return Err(err);
        }
    }
    Ok(())
}

/// No-op on targets without mlockall.
#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> std::io::Result<()> {
    Ok(())
}
