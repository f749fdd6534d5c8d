//! # Shared Mutex
//!
//! A spinlock whose only state is one word in shared memory: zero when
//! free, otherwise the pid of the holding process. Every process that maps
//! the region binds its own [`SharedMutex`] handle to the same word.
//!
//! There is no kernel wait object behind the lock. `lock()` spins with
//! exponential backoff and then yields the CPU, forever. If a holder dies
//! inside its critical section the word keeps its pid until someone calls
//! [`SharedMutex::force_unlock`] (or [`SharedMutex::recover`]).

use crate::{MemError, MemResult};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use hcore_hal::cpu::Backoff;
use hcore_hal::process::{self, Pid};

/// Default spin bound before yielding
pub const DEFAULT_SPIN: usize = 1 << 11;

/// The part of the mutex that lives in shared memory
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedLock {
    /// 0 when unlocked, else the owner pid
    lock: AtomicU64,
}

static_assertions::assert_eq_size!(SharedLock, u64);

impl SharedLock {
    /// A fresh, unlocked lock word
    pub const fn new() -> Self {
        Self {
            lock: AtomicU64::new(0),
        }
    }

    /// Reset to unlocked. Only valid while no process uses the lock.
    pub fn init(&mut self) {
        *self.lock.get_mut() = 0;
    }

    /// Raw word, for diagnostics
    pub fn load(&self) -> u64 {
        self.lock.load(Ordering::Acquire)
    }
}

/// Process-local handle to a [`SharedLock`].
///
/// Not reentrant: locking twice from the same process spins forever.
pub struct SharedMutex {
    lock: NonNull<SharedLock>,
    spin: usize,
}

impl SharedMutex {
    /// Bind a handle to the lock word at `lock` with the default spin bound.
    ///
    /// # Safety
    ///
    /// `lock` must point to a `SharedLock` that stays mapped for the life of
    /// the handle.
    pub unsafe fn new(lock: *const SharedLock) -> MemResult<Self> {
        // SAFETY: forwarded.
        unsafe { Self::with_spin(lock, DEFAULT_SPIN) }
    }

    /// Bind a handle with an explicit spin bound. `usize::MAX` effectively
    /// never yields.
    ///
    /// # Safety
    ///
    /// Same as [`SharedMutex::new`].
    pub unsafe fn with_spin(lock: *const SharedLock, spin: usize) -> MemResult<Self> {
        debug_assert!(!lock.is_null(), "shared lock must not be null");
        let lock = NonNull::new(lock as *mut SharedLock).ok_or(MemError::InvalidAddress)?;
        Ok(Self { lock, spin })
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        // SAFETY: the caller of `new` guaranteed the lock outlives us.
        unsafe { &self.lock.as_ref().lock }
    }

    #[inline]
    fn acquire(&self, pid: u64) -> bool {
        self.word().load(Ordering::Relaxed) == 0
            && self
                .word()
                .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Spin bound of this handle
    pub fn spin(&self) -> usize {
        self.spin
    }

    /// Acquire the lock, spinning and yielding until it is free.
    pub fn lock(&self) {
        let pid = pid_word(process::current_pid());
        let mut backoff = Backoff::new(self.spin);

        while !self.acquire(pid) {
            backoff.snooze();
        }
    }

    /// Single acquisition attempt.
    pub fn try_lock(&self) -> bool {
        self.acquire(pid_word(process::current_pid()))
    }

    /// Release the lock if this process holds it.
    ///
    /// Returns false (and changes nothing) when another process, or nobody,
    /// holds the lock. Releasing someone else's lock is a caller error.
    pub fn unlock(&self) -> bool {
        let pid = pid_word(process::current_pid());
        if self
            .word()
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            self.wakeup();
            return true;
        }
        false
    }

    /// Clear the lock if `pid` holds it. For recovering from a dead holder.
    pub fn force_unlock(&self, pid: Pid) -> bool {
        if self
            .word()
            .compare_exchange(pid_word(pid), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.wakeup();
            return true;
        }
        false
    }

    /// Pid of the current holder, if any
    pub fn owner(&self) -> Option<Pid> {
        match self.word().load(Ordering::Acquire) {
            0 => None,
            pid => Pid::try_from(pid).ok(),
        }
    }

    /// Is the lock held by anyone?
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Does the calling process hold the lock?
    pub fn is_held_by_current(&self) -> bool {
        self.owner() == Some(process::current_pid())
    }

    /// Force-unlock if the recorded holder no longer exists.
    ///
    /// Returns the pid that was evicted.
    pub fn recover(&self) -> Option<Pid> {
        let owner = self.owner()?;
        if process::is_alive(owner) {
            return None;
        }
        if self.force_unlock(owner) {
            log::warn!("shared mutex: released lock held by dead process {}", owner);
            return Some(owner);
        }
        None
    }

    /// Acquire the lock and release it when the guard drops.
    pub fn guard(&self) -> SharedMutexGuard<'_> {
        self.lock();
        SharedMutexGuard { mutex: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_guard(&self) -> Option<SharedMutexGuard<'_>> {
        self.try_lock().then(|| SharedMutexGuard { mutex: self })
    }

    /// Wake waiters after a release. Waiters only spin for now, so there is
    /// nobody to wake; a blocking variant would need a cross-process futex.
    #[inline]
    fn wakeup(&self) {}
}

#[inline]
fn pid_word(pid: Pid) -> u64 {
    debug_assert!(pid > 0);
    pid as u32 as u64
}

impl fmt::Debug for SharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutex")
            .field("owner", &self.owner())
            .field("spin", &self.spin)
            .finish()
    }
}

// SAFETY: the handle only touches the lock word through atomics.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

/// RAII guard for [`SharedMutex`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl fmt::Debug for SharedMutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutexGuard").finish_non_exhaustive()
    }
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;
    use hcore_hal::{Mapping, Protection};
    use std::time::Duration;

    /// A lock word plus a step counter in fork-shared memory.
    struct Shared {
        map: Mapping,
    }

    impl Shared {
        fn new() -> Self {
            Self {
                map: Mapping::anonymous(4096, Protection::data()).unwrap(),
            }
        }

        fn lock(&self) -> *const SharedLock {
            self.map.as_ptr() as *const SharedLock
        }

        fn step(&self) -> &AtomicU64 {
            unsafe { &*(self.map.as_ptr().add(64) as *const AtomicU64) }
        }

        fn word(&self) -> u64 {
            unsafe { (*self.lock()).load() }
        }

        fn mutex(&self) -> SharedMutex {
            unsafe { SharedMutex::new(self.lock()).unwrap() }
        }

        fn wait_step(&self, expected: u64) {
            while self.step().load(Ordering::Acquire) != expected {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn next_step(&self) {
            self.step().fetch_add(1, Ordering::AcqRel);
        }
    }

    fn child_exit(ok: bool) -> ! {
        unsafe { libc::_exit(if ok { 0 } else { 1 }) }
    }

    fn wait_child(pid: libc::pid_t) -> i32 {
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        libc::WEXITSTATUS(status)
    }

    fn me() -> u64 {
        process::current_pid() as u64
    }

    #[test]
    fn test_new_rejects_null() {
        if cfg!(debug_assertions) {
            return;
        }
        let res = unsafe { SharedMutex::new(core::ptr::null()) };
        assert_eq!(res.err(), Some(MemError::InvalidAddress));
    }

    #[test]
    fn test_spin_configuration() {
        let shared = Shared::new();
        assert_eq!(shared.mutex().spin(), 2048);

        let never_yield = unsafe { SharedMutex::with_spin(shared.lock(), usize::MAX).unwrap() };
        assert_eq!(never_yield.spin(), usize::MAX);
    }

    #[test]
    fn test_trylock() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        assert!(mtx.try_lock());
        assert_eq!(shared.word(), me());
        assert!(mtx.unlock());
        assert_eq!(shared.word(), 0);

        // Not reentrant
        assert!(mtx.try_lock());
        assert!(!mtx.try_lock());
        assert!(mtx.unlock());
        assert!(mtx.try_lock());
        assert!(mtx.unlock());

        mtx.lock();
        assert!(!mtx.try_lock());
        assert!(mtx.unlock());
    }

    #[test]
    fn test_lock_records_pid() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        mtx.lock();
        assert_eq!(shared.word(), me());
        assert_eq!(mtx.owner(), Some(process::current_pid()));
        assert!(mtx.is_held_by_current());
        mtx.unlock();
        assert_eq!(shared.word(), 0);
        assert_eq!(mtx.owner(), None);
    }

    #[test]
    fn test_unlock_when_unlocked_is_noop() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        assert!(!mtx.unlock());
        assert_eq!(shared.word(), 0);
    }

    #[test]
    fn test_two_handles_one_word() {
        let shared = Shared::new();
        let a = shared.mutex();
        let b = shared.mutex();

        assert!(a.try_lock());
        assert!(!b.try_lock());
        // Same pid: either handle may release
        assert!(b.unlock());
        assert!(a.try_lock());
        a.unlock();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        {
            let _guard = mtx.guard();
            assert!(mtx.is_locked());
            assert!(mtx.try_guard().is_none());
            assert!(mtx.is_held_by_current());
        }
        assert!(!mtx.is_locked());
        assert!(mtx.try_guard().is_some());
        assert!(!mtx.is_locked());
    }

    #[test]
    fn test_force_unlock_own_lock() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        mtx.lock();
        assert!(mtx.force_unlock(process::current_pid()));
        assert_eq!(shared.word(), 0);

        // Nothing to clear
        assert!(!mtx.force_unlock(process::current_pid()));
        assert_eq!(shared.word(), 0);
    }

    #[test]
    fn test_force_unlock_wrong_pid() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        mtx.lock();
        assert!(!mtx.force_unlock(process::current_pid() + 1));
        assert_eq!(shared.word(), me());
        mtx.unlock();
    }

    #[test]
    fn test_unlock_by_other_process_is_noop() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            mtx.lock();
            let held = shared.word() == me();
            shared.next_step();

            shared.wait_step(2);
            let released = mtx.unlock() && shared.word() == 0;
            shared.next_step();
            child_exit(held && released);
        }

        shared.wait_step(1);
        assert_eq!(shared.word(), pid as u64);
        assert!(!mtx.unlock());
        assert_eq!(shared.word(), pid as u64);
        assert!(!mtx.try_lock());
        shared.next_step();

        shared.wait_step(3);
        assert!(mtx.try_lock());
        assert_eq!(shared.word(), me());
        assert!(mtx.unlock());
        assert_eq!(wait_child(pid), 0);
    }

    #[test]
    fn test_force_unlock_other_process() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            mtx.lock();
            shared.next_step();
            shared.wait_step(2);
            child_exit(true);
        }

        shared.wait_step(1);
        assert_eq!(mtx.owner(), Some(pid));
        assert!(mtx.force_unlock(pid));
        assert_eq!(shared.word(), 0);
        shared.next_step();
        assert_eq!(wait_child(pid), 0);
    }

    #[test]
    fn test_recover_from_dead_holder() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            // Die while holding the lock
            mtx.lock();
            child_exit(true);
        }
        assert_eq!(wait_child(pid), 0);

        assert_eq!(mtx.owner(), Some(pid));
        assert!(!mtx.try_lock());
        assert_eq!(mtx.recover(), Some(pid));
        assert!(mtx.try_lock());
        // A live holder is left alone
        assert_eq!(mtx.recover(), None);
        mtx.unlock();
    }

    #[test]
    fn test_lock_handoff_between_processes() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            mtx.lock();
            shared.next_step();
            shared.wait_step(2);
            let ok = mtx.unlock();
            shared.next_step();
            child_exit(ok);
        }

        shared.wait_step(1);
        assert_eq!(shared.word(), pid as u64);
        assert!(!mtx.try_lock());
        shared.next_step();

        shared.wait_step(3);
        assert_eq!(shared.word(), 0);
        assert!(mtx.try_lock());
        assert_eq!(shared.word(), me());
        mtx.unlock();
        assert_eq!(wait_child(pid), 0);
    }

    #[test]
    fn test_blocking_lock_waits_for_release() {
        let shared = Shared::new();
        let mtx = shared.mutex();

        mtx.lock();
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            shared.next_step();
            // Spins and yields until the parent releases
            mtx.lock();
            let ok = mtx.is_held_by_current();
            mtx.unlock();
            child_exit(ok);
        }

        shared.wait_step(1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(shared.word(), me());
        mtx.unlock();
        assert_eq!(wait_child(pid), 0);
        assert_eq!(shared.word(), 0);
    }
}
