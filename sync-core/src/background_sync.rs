/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Switches the retry executor's poll cadence with the host application's
//! foreground/background lifecycle, so a backgrounded app polls rarely
//! (saving battery and radio wakeups) while a foregrounded one stays
//! responsive.

use crate::queue::retry_executor::RetryExecutor;
use std::sync::Arc;

pub struct BackgroundSyncManager {
    retry_executor: Arc<RetryExecutor>,
}

impl BackgroundSyncManager {
    pub fn new(retry_executor: Arc<RetryExecutor>) -> Self {
        Self { retry_executor }
    }

    pub fn on_app_foregrounded(&self) {
        self.retry_executor.set_background_mode(false);
    }

    pub fn on_app_backgrounded(&self) {
        self.retry_executor.set_background_mode(true);
    }

    /// Forces an immediate drain of due tasks on the foreground queue,
    /// used for an explicit "sync now" action.
    pub async fn sync_now(&self) -> Result<usize, crate::error::Error> {
        self.retry_executor.process_due_tasks_now(true).await
    }
}
