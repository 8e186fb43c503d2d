/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An offline-first synchronization core: a durable, coalescing operation
//! log (`store::sync_queue`), a three-queue admission scheduler
//! (`queue`), a save/load policy engine (`repository`), id negotiation
//! with cascading foreign-key rewrites (`id_negotiation`), merge-on-
//! refresh reconciliation (`refresh`), cascade delete with cycle
//! detection (`cascade`), connectivity-aware pause/resume
//! (`connectivity`, `background_sync`), and a full-reset escape hatch
//! (`obliterate`).
//!
//! A host application implements `model::Model` for each synced entity
//! type, provides a `store::Dao<T>` (the bundled `store::MemoryDao` is a
//! usable reference implementation) and an `http::HttpAdapter<T>`, builds
//! a `Repository<T>`, and registers it so the retry executor can dispatch
//! queued work to it by `Model::model_type()` alone.

pub mod background_sync;
pub mod cascade;
pub mod change_stream;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod http;
pub mod id_negotiation;
pub mod model;
pub mod obliterate;
pub mod queue;
pub mod refresh;
pub mod registry;
pub mod repository;
pub mod store;

pub mod testing;

pub use change_stream::RepositoryChange;
pub use config::{Config, LoadPolicy, QueueConfig, SavePolicy};
pub use error::{Error, ErrorKind};
pub use model::{Model, Relation};
pub use obliterate::obliterate_local_storage;
pub use queue::retry_executor::RetryExecutor;
pub use queue::{QueueKind, QueueManager, QueueStats};
pub use repository::Repository;

/// Creates the `sync_queue` table on a fresh connection. Call once per
/// connection before constructing any `Repository`.
pub fn init_schema(conn: &rusqlite::Connection) -> Result<(), Error> {
    store::sync_queue::init(conn)
}
