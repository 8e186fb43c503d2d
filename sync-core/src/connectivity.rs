/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Bridges a host-supplied connectivity signal to the queue manager and
//! retry executor: going offline cancels in-flight/pending work so
//! callers don't hang waiting on a dead network, coming back online
//! kicks an immediate replay of the durable operation log.

use crate::error::Error;
use crate::queue::retry_executor::RetryExecutor;
use crate::queue::QueueManager;
use parking_lot::Mutex as PLMutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type Checker = Box<dyn Fn() -> Result<bool, Error> + Send + Sync>;

/// The connectivity answer the retry executor consults before draining due
/// tasks, and a host application can consult directly via `is_connected`.
/// Tracks the last value seen on the `connectivityStream`; before the
/// first one arrives (or if the stream has never been wired up at all),
/// falls back to an optional checker, and to "online" if there is none or
/// it errors -- an unknown connectivity state should never wedge the
/// queue shut.
pub struct ConnectivityState {
    last_known: PLMutex<Option<bool>>,
    checker: Option<Checker>,
}

impl ConnectivityState {
    pub fn new(checker: Option<Checker>) -> Arc<Self> {
        Arc::new(Self {
            last_known: PLMutex::new(None),
            checker,
        })
    }

    pub fn is_connected(&self) -> bool {
        if let Some(known) = *self.last_known.lock() {
            return known;
        }
        match &self.checker {
            Some(checker) => checker().unwrap_or(true),
            None => true,
        }
    }

    fn set_last_known(&self, online: bool) {
        *self.last_known.lock() = Some(online);
    }
}

pub struct ConnectivitySupervisor {
    queue_manager: Arc<QueueManager>,
    retry_executor: Arc<RetryExecutor>,
    state: Arc<ConnectivityState>,
    task: PLMutex<Option<JoinHandle<()>>>,
}

impl ConnectivitySupervisor {
    /// `checker` backs `is_connected()` whenever the stream hasn't emitted
    /// a value yet; pass `None` if the host has no polling fallback.
    pub fn new(queue_manager: Arc<QueueManager>, retry_executor: Arc<RetryExecutor>, checker: Option<Checker>) -> Arc<Self> {
        let state = ConnectivityState::new(checker);
        retry_executor.set_connectivity(state.clone());
        Arc::new(Self {
            queue_manager,
            retry_executor,
            state,
            task: PLMutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Starts watching `connectivity` (`true` == online) for transitions.
    /// The initial value is taken as the starting state without firing a
    /// transition.
    pub fn start(self: &Arc<Self>, mut connectivity: watch::Receiver<bool>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut was_online = *connectivity.borrow();
            this.state.set_last_known(was_online);
            loop {
                if connectivity.changed().await.is_err() {
                    break;
                }
                let online = *connectivity.borrow();
                this.state.set_last_known(online);
                if online == was_online {
                    continue;
                }
                was_online = online;
                if online {
                    log::info!("connectivity restored, resuming sync");
                    this.queue_manager.restore_on_connect();
                    this.retry_executor.start();
                    let _ = this.retry_executor.process_due_tasks_now(false).await;
                } else {
                    log::info!("connectivity lost, pausing sync");
                    this.queue_manager.clear_on_disconnect();
                    this.retry_executor.stop();
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
