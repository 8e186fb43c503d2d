/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The contract a host application implements for each synced entity type.
//!
//! Concrete per-model DAOs, JSON codecs and HTTP adapters are intentionally
//! external collaborators -- this crate only depends on the shape described
//! here, the same way `sync15_traits::SyncEngine` lets `sync_manager` drive
//! arbitrary collections without knowing their storage layout.

use crate::error::Error;

/// Describes a foreign-key relationship from a child model type back to
/// this one, used by id negotiation (to rewrite references after a
/// temporary client id is replaced by a server id) and cascade delete.
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    /// The registered `Model::model_type()` of the dependent entity.
    pub child_type: &'static str,
    /// The JSON field on the child's payload that holds this model's id.
    pub foreign_key_field: &'static str,
    /// Whether deleting a parent should cascade-delete matching children.
    pub cascade_delete: bool,
}

pub trait Model: Clone + Send + Sync + 'static {
    /// A stable name used as the registry key and as `sync_queue.model_type`.
    fn model_type() -> &'static str
    where
        Self: Sized;

    fn id(&self) -> &str;

    /// Returns a copy of this entity with its id replaced -- used after id
    /// negotiation assigns a server-generated id to a locally created row.
    fn with_id(&self, new_id: &str) -> Self;

    fn to_json(&self) -> Result<serde_json::Value, Error>;

    fn from_json(value: serde_json::Value) -> Result<Self, Error>
    where
        Self: Sized;

    /// If true, `create` leaves id assignment to the server and the local
    /// row is provisionally keyed under a generated temporary client id
    /// until the corresponding sync queue task completes.
    fn uses_server_generated_id() -> bool
    where
        Self: Sized;

    /// Child relations to walk during id negotiation and cascade delete.
    /// Most models have none.
    fn relations() -> &'static [Relation]
    where
        Self: Sized,
    {
        &[]
    }

    /// Monotonic update timestamp (ms since epoch), used to break merge
    /// conflicts on refresh. `None` if the model doesn't track one, in
    /// which case the remote copy always wins.
    fn updated_at_millis(&self) -> Option<i64> {
        None
    }
}
