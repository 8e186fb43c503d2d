/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A process-global directory mapping a `Model::model_type()` string to
//! the type-erased repository that owns it, so the retry executor can
//! dispatch a due `sync_queue` row without being generic over every model
//! type the host application has registered. Modeled after this
//! workspace's `error-support::reporting` hook: a `lazy_static`
//! `RwLock`-guarded slot callers install themselves into at startup.

use crate::error::Error;
use crate::model::Relation;
use crate::store::sync_queue::SyncQueueEntry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What happened when a repository dispatched one due sync queue task.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The task reached the server and its queue row should be deleted.
    Succeeded,
    /// A transient failure; the caller should record it and back off.
    Failed(Error),
    /// The task reached the server and a local temporary id was replaced.
    IdAssigned { old_id: String, new_id: String },
}

/// The type-erased half of `Repository<T>` the retry executor, id
/// negotiation and cascade delete talk to. Everything generic over
/// `T: Model` lives behind this seam, the same role
/// `sync15_traits::SyncEngine` plays for `sync_manager`.
#[async_trait]
pub trait RepositoryOps: Send + Sync {
    fn model_type(&self) -> &'static str;

    fn relations(&self) -> &'static [Relation];

    async fn dispatch(&self, entry: SyncQueueEntry) -> DispatchOutcome;

    /// Rewrites any locally stored rows whose `field` references `old_id`
    /// to reference `new_id` instead, part of id negotiation's FK cascade.
    fn rewrite_foreign_key(&self, field: &'static str, old_id: &str, new_id: &str) -> Result<(), Error>;

    /// The local ids of rows whose `field` currently equals `parent_id`,
    /// used by cascade delete to find dependents without this crate
    /// knowing the child's concrete type.
    fn find_children_ids(&self, field: &'static str, parent_id: &str) -> Result<Vec<String>, Error>;

    /// Removes a row from local storage and drops/enqueues the matching
    /// sync queue delete, without recursing into its own children --
    /// cascade delete's traversal does that with its own cycle guard.
    fn delete_local_cascaded(&self, id: &str) -> Result<(), Error>;

    /// Clears this model's local rows only, leaving the sync queue and
    /// the registration itself untouched. Used directly by a host
    /// application's `truncateLocal()` call and by `obliterate_local_storage`.
    fn truncate_local(&self) -> Result<(), Error>;

    /// Publishes a `RepositoryChange::SyncError` to this model's own
    /// change stream without closing it, so a UI layer watching this
    /// repository learns a background operation was dead-lettered.
    fn notify_sync_error(&self, err: Arc<Error>);
}

lazy_static::lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn RepositoryOps>>> = RwLock::new(HashMap::new());
}

pub fn register(repo: Arc<dyn RepositoryOps>) {
    REGISTRY
        .write()
        .insert(repo.model_type().to_string(), repo);
}

pub fn unregister(model_type: &str) {
    REGISTRY.write().remove(model_type);
}

pub fn lookup(model_type: &str) -> Option<Arc<dyn RepositoryOps>> {
    REGISTRY.read().get(model_type).cloned()
}

pub fn require(model_type: &str) -> Result<Arc<dyn RepositoryOps>, Error> {
    lookup(model_type).ok_or_else(|| Error::from(crate::error::ErrorKind::NotRegistered(model_type.to_string())))
}

/// Every currently registered repository, in no particular order. Used by
/// `obliterate_local_storage` to truncate every model's local rows without
/// this crate needing to know their concrete types.
pub fn all() -> Vec<Arc<dyn RepositoryOps>> {
    REGISTRY.read().values().cloned().collect()
}

/// Empties the registry. Exposed for tests that register fixture
/// repositories across multiple `#[tokio::test]` functions sharing one
/// process-wide `REGISTRY`.
pub fn clear_for_test() {
    REGISTRY.write().clear();
}
