/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Durable storage contracts: a per-entity `Dao<T>` and the generic,
//! in-memory reference implementation `MemoryDao` used by tests and by
//! host applications that haven't wired up a generated/hand-rolled DAO
//! yet. The concrete on-disk layout for a given model type is always an
//! external collaborator -- see `model::Model` -- with the one exception
//! of the sync queue itself, whose schema is fixed and lives in
//! `sync_queue`.

mod query;
pub mod sync_queue;

pub use query::{Filter, OrderBy, Query};

use crate::error::Error;
use crate::model::Model;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-entity data access contract. Deliberately synchronous: like most
/// `places`/`logins`-style storage layers, durable reads and writes here
/// are plain blocking SQLite-or-equivalent calls; only the network side of
/// this crate (`http::HttpAdapter`) is async.
pub trait Dao<T: Model>: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<T>, Error>;
    fn get_all(&self, query: &Query) -> Result<Vec<T>, Error>;
    fn put(&self, entity: &T) -> Result<(), Error>;
    fn delete(&self, id: &str) -> Result<()>;
    fn truncate(&self) -> Result<(), Error>;

    /// Rewrites a row's primary key in place, used once by id negotiation
    /// when a temporary client id is replaced by a server-assigned one.
    fn rewrite_id(&self, old_id: &str, new_id: &str) -> Result<(), Error>;

    /// A live view of a single row, updated on every `put`/`delete` that
    /// touches `id`. `None` means the row doesn't currently exist.
    fn watch(&self, id: &str) -> watch::Receiver<Option<T>>;

    /// A live view of the rows currently matching `query`. Re-evaluated
    /// (not just appended to) on every mutation, since a `put` can cause a
    /// row to enter or leave the result set.
    fn watch_all(&self, query: Query) -> watch::Receiver<Vec<T>>;
}

type Result<T, E = Error> = std::result::Result<T, E>;

struct MemoryDaoInner<T: Model> {
    rows: HashMap<String, T>,
    row_watchers: HashMap<String, watch::Sender<Option<T>>>,
    collection_watchers: Vec<(Query, watch::Sender<Vec<T>>)>,
}

/// A generic, process-local `Dao<T>` backed by a `HashMap`. Good enough for
/// tests and for prototyping a model type before a real generated DAO
/// exists; not durable across restarts.
pub struct MemoryDao<T: Model> {
    inner: Mutex<MemoryDaoInner<T>>,
}

impl<T: Model> Default for MemoryDao<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryDaoInner {
                rows: HashMap::new(),
                row_watchers: HashMap::new(),
                collection_watchers: Vec::new(),
            }),
        }
    }
}

impl<T: Model> MemoryDao<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn notify(inner: &mut MemoryDaoInner<T>, id: &str) {
        if let Some(tx) = inner.row_watchers.get(id) {
            let _ = tx.send(inner.rows.get(id).cloned());
        }
        inner
            .collection_watchers
            .retain(|(_, tx)| tx.receiver_count() > 0);
        let rows: Vec<T> = inner.rows.values().cloned().collect();
        for (query, tx) in &inner.collection_watchers {
            let json_rows: Vec<serde_json::Value> = rows
                .iter()
                .filter_map(|r| r.to_json().ok())
                .collect();
            let matching_ids: std::collections::HashSet<String> = query
                .apply(json_rows)
                .into_iter()
                .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(str::to_owned))
                .collect();
            let matching: Vec<T> = rows
                .iter()
                .filter(|r| matching_ids.contains(r.id()))
                .cloned()
                .collect();
            let _ = tx.send(matching);
        }
    }
}

impl<T: Model> Dao<T> for MemoryDao<T> {
    fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.inner.lock().rows.get(id).cloned())
    }

    fn get_all(&self, query: &Query) -> Result<Vec<T>> {
        let inner = self.inner.lock();
        let rows: Vec<T> = inner.rows.values().cloned().collect();
        let json_rows: Vec<serde_json::Value> = rows
            .iter()
            .filter_map(|r| r.to_json().ok())
            .collect();
        let matching_ids: std::collections::HashSet<String> = query
            .apply(json_rows)
            .into_iter()
            .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(str::to_owned))
            .collect();
        Ok(rows
            .into_iter()
            .filter(|r| matching_ids.contains(r.id()))
            .collect())
    }

    fn put(&self, entity: &T) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = entity.id().to_string();
        inner.rows.insert(id.clone(), entity.clone());
        Self::notify(&mut inner, &id);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.rows.remove(id);
        Self::notify(&mut inner, id);
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner.rows.keys().cloned().collect();
        inner.rows.clear();
        for id in ids {
            Self::notify(&mut inner, &id);
        }
        Ok(())
    }

    fn rewrite_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entity) = inner.rows.remove(old_id) {
            let renamed = entity.with_id(new_id);
            inner.rows.insert(new_id.to_string(), renamed);
        }
        Self::notify(&mut inner, old_id);
        Self::notify(&mut inner, new_id);
        Ok(())
    }

    fn watch(&self, id: &str) -> watch::Receiver<Option<T>> {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.row_watchers.get(id) {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(inner.rows.get(id).cloned());
        inner.row_watchers.insert(id.to_string(), tx);
        rx
    }

    fn watch_all(&self, query: Query) -> watch::Receiver<Vec<T>> {
        let mut inner = self.inner.lock();
        let initial = {
            let rows: Vec<T> = inner.rows.values().cloned().collect();
            let json_rows: Vec<serde_json::Value> =
                rows.iter().filter_map(|r| r.to_json().ok()).collect();
            let matching_ids: std::collections::HashSet<String> = query
                .clone()
                .apply(json_rows)
                .into_iter()
                .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(str::to_owned))
                .collect();
            rows.into_iter()
                .filter(|r| matching_ids.contains(r.id()))
                .collect()
        };
        let (tx, rx) = watch::channel(initial);
        inner.collection_watchers.push((query, tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Widget {
        id: String,
        name: String,
    }

    impl Model for Widget {
        fn model_type() -> &'static str {
            "widget"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn with_id(&self, new_id: &str) -> Self {
            Widget {
                id: new_id.to_string(),
                name: self.name.clone(),
            }
        }
        fn to_json(&self) -> Result<serde_json::Value, Error> {
            Ok(json!({"id": self.id, "name": self.name}))
        }
        fn from_json(value: serde_json::Value) -> Result<Self, Error> {
            Ok(Widget {
                id: value["id"].as_str().unwrap().to_string(),
                name: value["name"].as_str().unwrap().to_string(),
            })
        }
        fn uses_server_generated_id() -> bool {
            false
        }
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dao: Arc<MemoryDao<Widget>> = MemoryDao::new();
        let w = Widget {
            id: "1".into(),
            name: "a".into(),
        };
        dao.put(&w).unwrap();
        assert_eq!(dao.get("1").unwrap().unwrap().name, "a");
        dao.delete("1").unwrap();
        assert!(dao.get("1").unwrap().is_none());
    }

    #[test]
    fn rewrite_id_moves_row() {
        let dao: Arc<MemoryDao<Widget>> = MemoryDao::new();
        dao.put(&Widget {
            id: "temp-1".into(),
            name: "a".into(),
        })
        .unwrap();
        dao.rewrite_id("temp-1", "server-1").unwrap();
        assert!(dao.get("temp-1").unwrap().is_none());
        assert_eq!(dao.get("server-1").unwrap().unwrap().id, "server-1");
    }

    #[test]
    fn query_filters_and_orders() {
        let dao: Arc<MemoryDao<Widget>> = MemoryDao::new();
        for (id, name) in [("1", "b"), ("2", "a"), ("3", "c")] {
            dao.put(&Widget {
                id: id.into(),
                name: name.into(),
            })
            .unwrap();
        }
        let q = Query::new().order_by("name", false);
        let rows = dao.get_all(&q).unwrap();
        let names: Vec<&str> = rows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
