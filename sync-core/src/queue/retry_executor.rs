/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Polls the durable operation log for due tasks and replays them against
//! whichever repository is registered for their `model_type`, adaptively
//! slowing down while the app is backgrounded.

use crate::config::Config;
use crate::connectivity::ConnectivityState;
use crate::error::Error;
use crate::queue::{QueueKind, QueueManager};
use crate::registry::{self, DispatchOutcome};
use crate::store::sync_queue::SyncQueueDao;
use parking_lot::Mutex as PLMutex;
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before 1970")
        .as_millis() as i64
}

/// Batch size read from the durable operation log per poll tick.
const BATCH_SIZE: usize = 25;

pub struct RetryExecutor {
    conn: Arc<PLMutex<Connection>>,
    queue_manager: Arc<QueueManager>,
    background_mode: AtomicBool,
    foreground_interval: std::time::Duration,
    background_interval: std::time::Duration,
    max_attempts: u32,
    retry_base_delay: std::time::Duration,
    retry_max_delay: std::time::Duration,
    running: AtomicBool,
    wake: Notify,
    task: PLMutex<Option<tokio::task::JoinHandle<()>>>,
    connectivity: PLMutex<Arc<ConnectivityState>>,
}

impl RetryExecutor {
    pub fn new(conn: Arc<PLMutex<Connection>>, queue_manager: Arc<QueueManager>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            conn,
            queue_manager,
            background_mode: AtomicBool::new(false),
            foreground_interval: config.foreground_poll_interval,
            background_interval: config.background_poll_interval,
            max_attempts: config.max_attempts,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            running: AtomicBool::new(false),
            wake: Notify::new(),
            task: PLMutex::new(None),
            connectivity: PLMutex::new(ConnectivityState::new(None)),
        })
    }

    pub fn set_background_mode(&self, background: bool) {
        self.background_mode.store(background, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wires this executor to a shared connectivity state so
    /// `process_due_tasks_now` becomes a no-op while offline. Called by
    /// `ConnectivitySupervisor::new`; an executor with no supervisor
    /// attached stays permanently "connected" and never gates itself.
    pub fn set_connectivity(&self, state: Arc<ConnectivityState>) {
        *self.connectivity.lock() = state;
    }

    fn poll_interval(&self) -> std::time::Duration {
        if self.background_mode.load(Ordering::SeqCst) {
            self.background_interval
        } else {
            self.foreground_interval
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                let _ = this.process_due_tasks_now(false).await;
                tokio::select! {
                    _ = tokio::time::sleep(this.poll_interval()) => {}
                    _ = this.wake.notified() => {}
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Drains up to one batch of due tasks immediately. `force_sync`
    /// admits the work onto the foreground queue (used when the app asks
    /// for a synchronous "sync now") instead of the background queue the
    /// adaptive poll loop normally uses.
    pub async fn process_due_tasks_now(&self, force_sync: bool) -> Result<usize, Error> {
        if !self.connectivity.lock().is_connected() {
            return Ok(0);
        }
        // Only the ids are snapshotted here -- a row's payload can be
        // rewritten mid-batch by another row's id negotiation (a sibling
        // create assigning a server id this row's foreign key referenced
        // as a temporary one), so each task is re-read fresh in `run_one`
        // rather than trusting this snapshot's copy of it.
        let due_ids: Vec<i64> = {
            let conn = self.conn.lock();
            SyncQueueDao::get_due_tasks(&conn, now_millis(), BATCH_SIZE)?
                .into_iter()
                .map(|e| e.id)
                .collect()
        };
        let mut processed = 0usize;
        for id in due_ids {
            let entry = {
                let conn = self.conn.lock();
                SyncQueueDao::get(&conn, id)?
            };
            let Some(entry) = entry else {
                // already completed or coalesced away by an earlier task
                // in this same batch.
                continue;
            };
            self.run_one(entry, force_sync).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn run_one(&self, entry: crate::store::sync_queue::SyncQueueEntry, force_sync: bool) -> Result<(), Error> {
        {
            let conn = self.conn.lock();
            SyncQueueDao::mark_in_progress(&conn, entry.id)?;
        }
        let repo = match registry::require(&entry.model_type) {
            Ok(repo) => repo,
            Err(e) => {
                let conn = self.conn.lock();
                SyncQueueDao::mark_failed(
                    &conn,
                    entry.id,
                    &e.to_string(),
                    false,
                    self.max_attempts,
                    self.retry_base_delay,
                    self.retry_max_delay,
                )?;
                return Ok(());
            }
        };

        let kind = if force_sync { QueueKind::Foreground } else { QueueKind::Background };
        let idempotency_key = entry.idempotency_key.clone();
        let entry_id = entry.id;
        let conn = self.conn.clone();
        let max_attempts = self.max_attempts;
        let base_delay = self.retry_base_delay;
        let max_delay = self.retry_max_delay;

        let outcome = self
            .queue_manager
            .enqueue(kind, Some(idempotency_key), async move { Ok(repo.dispatch(entry).await) })
            .await?;

        match outcome {
            DispatchOutcome::Succeeded => {
                let conn = conn.lock();
                SyncQueueDao::mark_succeeded(&conn, entry_id)?;
            }
            DispatchOutcome::IdAssigned { .. } => {
                // the repository already rewrote the queue row's model_id
                // as part of id negotiation; the row itself is done.
                let conn = conn.lock();
                SyncQueueDao::mark_succeeded(&conn, entry_id)?;
            }
            DispatchOutcome::Failed(err) => {
                let status = {
                    let conn = conn.lock();
                    SyncQueueDao::mark_failed(
                        &conn,
                        entry_id,
                        &err.to_string(),
                        err.is_network(),
                        max_attempts,
                        base_delay,
                        max_delay,
                    )?
                };
                if status == crate::store::sync_queue::QueueStatus::Dead {
                    error_support::report_error_to_app(repo.model_type().to_string(), err.to_string());
                    repo.notify_sync_error(Arc::new(err));
                }
            }
        }
        Ok(())
    }
}
