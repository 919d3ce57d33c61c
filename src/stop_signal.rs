// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation flag for background work
///
/// Compactions poll it between rows; validation scans poll it through a
/// [`PollGate`], so tight per-row loops only touch the shared flag every
/// few hundred iterations.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    /// Requests cancellation; running tasks stop at their next checkpoint.
    pub fn send(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// A rate-limited view of the signal, checking the flag once per
    /// `stride` calls.
    #[must_use]
    pub fn gate(&self, stride: u64) -> PollGate {
        PollGate {
            signal: self.clone(),
            stride: stride.max(1),
            calls: 0,
        }
    }
}

/// Strided poll over a [`StopSignal`]
pub struct PollGate {
    signal: StopSignal,
    stride: u64,
    calls: u64,
}

impl PollGate {
    /// Returns `true` once the signal was observed as stopped.
    ///
    /// Only every `stride`-th call reads the shared flag.
    pub fn is_stopped(&mut self) -> bool {
        self.calls += 1;

        if self.calls % self.stride == 0 {
            self.signal.is_stopped()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn signal_visible_to_clones() {
        let signal = StopSignal::default();
        let observer = signal.clone();

        assert!(!observer.is_stopped());
        signal.send();
        assert!(observer.is_stopped());
    }

    #[test]
    fn gate_polls_on_stride() {
        let signal = StopSignal::default();
        let mut gate = signal.gate(10);

        signal.send();

        // Calls 1..=9 skip the flag, call 10 observes it
        for _ in 0..9 {
            assert!(!gate.is_stopped());
        }
        assert!(gate.is_stopped());
    }
}
