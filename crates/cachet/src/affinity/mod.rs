//! CPU affinity plumbing.
//!
//! Reads and sets a task's CPU affinity through the raw
//! `sched_getaffinity`/`sched_setaffinity` calls, using the kernel's fixed
//! 16 × 64-bit mask layout. Conversion to and from [`Bitmap`] goes through
//! the kernel-word functions so the word-boundary arithmetic lives in one
//! tested place.

use cachet_common::{AFFINITY_WORDS, Bitmap, CachetError, CachetResult};

fn parse_pid(pid: &str) -> CachetResult<libc::pid_t> {
    let parsed: libc::pid_t = pid.trim().parse().map_err(|_| CachetError::InvalidPid {
        pid: pid.to_string(),
    })?;
    if parsed <= 0 {
        return Err(CachetError::InvalidPid {
            pid: pid.to_string(),
        });
    }
    Ok(parsed)
}

/// Read a task's CPU affinity mask.
///
/// # Errors
///
/// Returns [`CachetError::InvalidPid`] before any kernel call when `pid`
/// does not parse as a positive task id, and surfaces the kernel's errno
/// (no such process, permission) verbatim otherwise.
pub fn get_affinity(pid: &str) -> CachetResult<Bitmap> {
    let pid = parse_pid(pid)?;
    let mut mask = [0u64; AFFINITY_WORDS];

    // SAFETY: mask is a fixed 16x64-bit buffer matching the kernel's
    // affinity mask layout; its byte size is passed alongside the pointer.
    let rc = unsafe {
        libc::sched_getaffinity(
            pid,
            std::mem::size_of_val(&mask),
            mask.as_mut_ptr().cast::<libc::cpu_set_t>(),
        )
    };
    if rc != 0 {
        return Err(CachetError::Io(std::io::Error::last_os_error()));
    }

    Ok(Bitmap::from_kernel_words(&mask))
}

/// Set a task's CPU affinity mask.
///
/// # Errors
///
/// Returns [`CachetError::InvalidPid`] before any kernel call when `pid`
/// does not parse as a positive task id, and surfaces the kernel's errno
/// verbatim otherwise.
pub fn set_affinity(pid: &str, cpus: &Bitmap) -> CachetResult<()> {
    let pid = parse_pid(pid)?;
    let mask = cpus.to_kernel_words();

    // SAFETY: as above; the kernel copies the buffer before returning.
    let rc = unsafe {
        libc::sched_setaffinity(
            pid,
            std::mem::size_of_val(&mask),
            mask.as_ptr().cast::<libc::cpu_set_t>(),
        )
    };
    if rc != 0 {
        return Err(CachetError::Io(std::io::Error::last_os_error()));
    }

    tracing::debug!(pid, cpus = %cpus.to_cpulist(), "Set CPU affinity");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_validation_precedes_the_syscall() {
        assert!(matches!(
            get_affinity("not-a-pid"),
            Err(CachetError::InvalidPid { .. })
        ));
        assert!(get_affinity("").is_err());
        assert!(get_affinity("-1").is_err());
        assert!(set_affinity("0", &Bitmap::affinity()).is_err());
    }

    #[test]
    fn own_affinity_round_trips() {
        let pid = std::process::id().to_string();

        let current = get_affinity(&pid).unwrap();
        assert!(current.count_ones() > 0);

        // Setting the mask we just read must be accepted and observable.
        set_affinity(&pid, &current).unwrap();
        assert_eq!(get_affinity(&pid).unwrap(), current);
    }

    #[test]
    fn nonexistent_process_surfaces_errno() {
        // PID 1 exists; this one should not.
        let result = get_affinity("2147483646");
        assert!(matches!(result, Err(CachetError::Io(_))));
    }
}
