// SPDX-License-Identifier: Apache-2.0

//! Readiness notification
//!
//! A single mutex and condition variable pair models "some device became ready". Whoever
//! changes a ready-state broadcasts afterwards, waiters re-evaluate their condition.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Process-wide readiness notifier.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // The counter stays consistent even if a holder panicked.
        self.generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wakes up every waiter.
    pub fn broadcast(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Returns the number of broadcasts so far, modulo wrap-around.
    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    /// Waits until `poll` yields a value or `deadline` passes.
    ///
    /// `poll` is evaluated with the notifier locked, so a broadcast issued after a state
    /// change cannot be missed. `poll` must not broadcast itself, and nobody may broadcast
    /// while holding a lock `poll` takes.
    pub fn wait_until<T>(
        &self,
        deadline: Option<Instant>,
        mut poll: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let mut generation = self.lock();
        loop {
            if let Some(value) = poll() {
                return Some(value);
            }

            let seen = *generation;
            match deadline {
                None => {
                    while *generation == seen {
                        generation = self
                            .cond
                            .wait(generation)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                }

                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    generation = self
                        .cond
                        .wait_timeout(generation, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }

    /// Waits for a broadcast for at most `timeout`.
    pub fn wait_for(&self, timeout: Duration) {
        let generation = self.lock();
        let seen = *generation;
        let _ = self
            .cond
            .wait_timeout_while(generation, timeout, |g| *g == seen);
    }
}

/// Converts an epoll-style timeout in milliseconds into a deadline, `None` waits forever.
pub fn deadline(timeout: i32) -> Option<Instant> {
    match timeout {
        t if t < 0 => None,
        t => Some(Instant::now() + Duration::from_millis(t as u64)),
    }
}
