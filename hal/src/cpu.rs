//! # CPU Abstraction
//!
//! Spin-wait primitives used by busy-waiting locks: a pause hint for the
//! inner loop and a scheduler yield once spinning stops paying off.

use spin::relax::{RelaxStrategy, Spin};

/// Pause the CPU (for spinlocks)
///
/// Emits the architecture's spin-loop hint (`pause` on x86, `yield` on ARM).
#[inline(always)]
pub fn pause() {
    Spin::relax();
}

/// Give up the rest of the current scheduling quantum.
#[inline]
pub fn yield_now() {
    // SAFETY: sched_yield has no preconditions; its result is advisory.
    unsafe {
        libc::sched_yield();
    }
}

/// Exponential spin-then-yield backoff.
///
/// Each call to [`Backoff::snooze`] spins twice as long as the previous one
/// until the configured bound is reached, after which it yields the CPU and
/// starts over.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Spins performed on the next snooze
    step: usize,
    /// Spin bound before yielding
    limit: usize,
}

impl Backoff {
    /// Create a backoff that spins up to `limit` iterations before yielding
    pub const fn new(limit: usize) -> Self {
        Self { step: 1, limit }
    }

    /// Whether the next snooze will yield instead of spin
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.step >= self.limit
    }

    /// Wait a little. Returns `true` if this call yielded.
    pub fn snooze(&mut self) -> bool {
        if self.is_exhausted() {
            yield_now();
            self.step = 1;
            return true;
        }

        for _ in 0..self.step {
            pause();
        }
        self.step = self.step.saturating_mul(2);
        false
    }

    /// Reset to the shortest spin
    pub fn reset(&mut self) {
        self.step = 1;
    }
}
