/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The "wipe everything and start clean" escape hatch: cancels every
//! queued task, drops every registered model's local rows and the
//! durable operation log, and resets the retry executor's background
//! cadence -- without touching the registry itself, so repositories stay
//! usable afterward.

use crate::error::Error;
use crate::queue::retry_executor::RetryExecutor;
use crate::queue::QueueManager;
use crate::registry;
use crate::store::sync_queue::SyncQueueDao;
use rusqlite::Connection;

/// Safe to call repeatedly. Registrations survive; only data and in-flight
/// work are cleared.
pub fn obliterate_local_storage(
    conn: &Connection,
    queue_manager: &QueueManager,
    retry_executor: &RetryExecutor,
) -> Result<(), Error> {
    queue_manager.clear_on_disconnect();
    retry_executor.set_background_mode(false);

    for repo in registry::all() {
        repo.truncate_local()?;
    }
    SyncQueueDao::truncate(conn)?;

    log::warn!("obliterated local storage: all queues cancelled, all registered models truncated");
    Ok(())
}
