// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Intake tracker: counts handler invocations currently in flight.
//!
//! Every delivery handed to a handler is bracketed by [`InFlightTracker::begin`],
//! which returns a guard that decrements the count when dropped. The guard
//! fires on every exit path of the wrapped invocation (success, error, future
//! drop, panic unwind), so no handler is ever dropped from tracking.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe counter of in-flight handler invocations.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    running: AtomicUsize,
}

impl InFlightTracker {
    /// Create a tracker with nothing in flight.
    pub fn new() -> Self {
        Self {
            running: AtomicUsize::new(0),
        }
    }

    /// Record the start of a handler invocation. The returned guard records
    /// its completion when dropped.
    pub fn begin(&self) -> InFlightGuard<'_> {
        self.running.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { tracker: self }
    }

    /// Number of invocations currently in flight.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether nothing is in flight. Non-blocking.
    pub fn is_drained(&self) -> bool {
        self.running() == 0
    }

    /// Force the count back to zero.
    ///
    /// Used by the drain coordinator after an abandoned drain wait:
    /// invocations that outlive the wait keep running in the background but
    /// are no longer tracked. Their guards decrement saturating at zero, so a
    /// late completion cannot underflow the count.
    pub fn reset(&self) {
        self.running.store(0, Ordering::SeqCst);
    }
}

/// Scoped release for one tracked invocation.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .tracker
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }
}
