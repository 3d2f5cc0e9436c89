//! System-wide monotonic timestamps in seconds.
//!
//! `Instant` cannot be compared across processes, so frame timestamps are
//! taken from `CLOCK_MONOTONIC` directly: every process on the host reads
//! the same clock.

#[cfg(unix)]
pub fn monotonic_secs() -> f64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always supported.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return fallback_secs();
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

#[cfg(not(unix))]
pub fn monotonic_secs() -> f64 {
    fallback_secs()
}

fn fallback_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(f64::MIN_POSITIVE)
}
