//! # Process Identity
//!
//! Process ids are what the shared mutex stores in its lock word, so they
//! must be cheap to obtain and stable for the life of the process. After
//! `fork()` the child observes its own pid on the next call.

use cfg_if::cfg_if;

/// Operating system process id
pub type Pid = libc::pid_t;

// Lock words hold a pid zero-extended to 64 bits.
static_assertions::assert_eq_size!(Pid, i32);

/// Get the id of the calling process.
#[inline]
pub fn current_pid() -> Pid {
    // SAFETY: getpid has no preconditions and cannot fail.
    unsafe { libc::getpid() }
}

/// Check whether a process with the given id currently exists.
///
/// Uses the null signal: `kill(pid, 0)` performs the permission and
/// existence checks without delivering anything. A process owned by another
/// user still counts as alive.
pub fn is_alive(pid: Pid) -> bool {
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 is never delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || errno() == libc::EPERM
}

/// Read the calling thread's `errno`.
pub fn errno() -> i32 {
    cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: errno location is thread-local and always valid.
            unsafe { *libc::__errno_location() }
        } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
            // SAFETY: errno location is thread-local and always valid.
            unsafe { *libc::__error() }
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_pid_is_alive() {
        let pid = current_pid();
        assert!(pid > 0);
        assert!(is_alive(pid));
    }

    #[test]
    fn test_invalid_pid_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[test]
    fn test_reaped_child_not_alive() {
        // SAFETY: the child only calls _exit.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe { libc::_exit(0) };
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(!is_alive(pid));
    }
}
