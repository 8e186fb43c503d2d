/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::{Interrupted, Interruptee};
use std::sync::atomic::{AtomicUsize, Ordering};

// Shared counter for InterruptScope:
//   - The `interrupt()` method increments this.
//   - The `was_interrupted()` method checks if this was incremented since the `InterruptScope` was
//     created.
static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scope for interruptible operations.
///
/// The connectivity supervisor and the retry executor share clones of a
/// single `InterruptScope` for the duration of an offline period: going
/// offline calls `InterruptScope::interrupt()`, and any cascade delete or
/// long-running refresh in flight observes it via `err_if_interrupted()` on
/// its next check, without needing a reference back to the supervisor.
#[derive(Clone, Debug)]
pub struct InterruptScope {
    start_value: usize,
}

impl InterruptScope {
    #[inline]
    pub fn new() -> Self {
        Self {
            start_value: COUNTER.load(Ordering::Relaxed),
        }
    }

    /// Interrupt any `InterruptScope`s created before this call.
    #[inline]
    pub fn interrupt() {
        COUNTER.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn was_interrupted(&self) -> bool {
        COUNTER.load(Ordering::Relaxed) != self.start_value
    }

    #[inline]
    pub fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Default for InterruptScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Interruptee for InterruptScope {
    fn was_interrupted(&self) -> bool {
        InterruptScope::was_interrupted(self)
    }
}
