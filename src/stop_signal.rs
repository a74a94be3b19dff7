// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{atomic::AtomicBool, Arc};

/// Cancellation flag, observed by workers at iteration boundaries.
///
/// Workers never abort mid-build; they check the flag between assemblies
/// and between iterations, drain their frontier to the spill FIFO, and
/// then wait for shutdown.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_propagates_to_clones() {
        let signal = StopSignal::default();
        let observer = signal.clone();
        assert!(!observer.is_stopped());

        signal.send();
        assert!(observer.is_stopped());
    }
}
