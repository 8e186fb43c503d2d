/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The reactive side of a `Repository`: every local mutation, remote
//! reconciliation and background-sync failure is published here so a UI
//! layer can stay in sync without polling. Deliberately not built on
//! `tokio::sync::broadcast` -- its fixed-size ring buffer drops the oldest
//! message for a slow subscriber, and a dropped `Deleted` or `IdChanged`
//! event is exactly the kind of thing that leaves a UI showing a stale
//! row forever. Each subscriber instead gets its own unbounded queue.

use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum RepositoryChange<T> {
    Created(T),
    Updated(T),
    Deleted(String),
    /// A locally-generated temporary id was replaced by a server id.
    IdChanged { old_id: String, new_id: String },
    /// A background sync task for this repository's model type
    /// permanently failed (dead-lettered).
    SyncError(Arc<Error>),
}

pub struct ChangeStream<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RepositoryChange<T>>>>,
    disposed: Mutex<bool>,
}

impl<T: Clone + Send + 'static> Default for ChangeStream<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            disposed: Mutex::new(false),
        }
    }
}

impl<T: Clone + Send + 'static> ChangeStream<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RepositoryChange<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, change: RepositoryChange<T>) {
        if *self.disposed.lock() {
            return;
        }
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Once disposed, no further events are delivered, even to
    /// subscribers who haven't drained their queue yet. Mirrors
    /// `Repository::dispose()`.
    pub fn dispose(&self) {
        *self.disposed.lock() = true;
        self.subscribers.lock().clear();
    }
}
