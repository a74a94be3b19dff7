// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Resettable boolean event, the explicit-message-passing sibling of
/// [`crate::stop_signal::StopSignal`]: waiters block until some other
/// thread sets it.
///
/// Used for the spill FIFO's "data available" flag and the worker
/// lifecycle flags (finished, shutdown). Share via `Arc`.
#[derive(Default)]
pub struct Event {
    state: Mutex<bool>,
    signal: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = true;
        self.signal.notify_all();
    }

    pub fn clear(&self) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("lock is poisoned");
        *state = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let state = self.state.lock().expect("lock is poisoned");
        *state
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("lock is poisoned");
        while !*state {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            {
                state = self.signal.wait(state).expect("lock is poisoned");
            }
        }
    }

    /// Blocks until the event is set or `timeout` elapses; returns whether
    /// the event is set.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("lock is poisoned");

        let deadline = std::time::Instant::now() + timeout;
        while !*state {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) else {
                return false;
            };

            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let (guard, result) = self
                .signal
                .wait_timeout(state, remaining)
                .expect("lock is poisoned");
            state = guard;

            if result.timed_out() && !*state {
                return false;
            }
        }
        true
    }
}
