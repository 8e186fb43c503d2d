/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Test doubles for exercising a `Repository<T>` without a real network
//! stack, the same role `viaduct-dev`'s test backends play for `viaduct`
//! consumers.

use crate::error::Error;
use crate::http::{FindOneOutcome, HttpAdapter, HttpErrorKind};
use crate::model::Model;
use crate::store::Query;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FailureScript {
    /// Number of times the next call to each method should fail with a
    /// network error before succeeding.
    network_failures: HashMap<&'static str, u32>,
    /// Number of times the next call to each method should fail with a
    /// 404 before succeeding, e.g. to drive an `update` -> `create`
    /// fallback that itself 404s.
    not_found_failures: HashMap<&'static str, u32>,
}

/// An in-memory `HttpAdapter` a test can both read from and script
/// failures into: `fail_next("create", 2)` makes the next two
/// `create_one` calls return a network error before succeeding.
pub struct FakeHttpAdapter<T: Model> {
    rows: Mutex<HashMap<String, T>>,
    gone: Mutex<std::collections::HashSet<String>>,
    next_id: AtomicU64,
    script: Mutex<FailureScript>,
}

impl<T: Model> Default for FakeHttpAdapter<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            gone: Mutex::new(std::collections::HashSet::new()),
            next_id: AtomicU64::new(1),
            script: Mutex::new(FailureScript::default()),
        }
    }
}

impl<T: Model> FakeHttpAdapter<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, entity: T) {
        self.rows.lock().insert(entity.id().to_string(), entity);
    }

    pub fn mark_gone(&self, id: &str) {
        self.gone.lock().insert(id.to_string());
    }

    pub fn fail_next(&self, method: &'static str, times: u32) {
        self.script.lock().network_failures.insert(method, times);
    }

    /// Makes the next `times` calls to `method` return a 404 rather than
    /// succeeding, e.g. `fail_next_not_found("create", 1)` to make a
    /// `create` fallback 404 as well as the `update` it followed.
    pub fn fail_next_not_found(&self, method: &'static str, times: u32) {
        self.script.lock().not_found_failures.insert(method, times);
    }

    fn maybe_fail(&self, method: &'static str) -> Result<(), Error> {
        let mut script = self.script.lock();
        if let Some(remaining) = script.network_failures.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::from(HttpErrorKind::Network(format!("{method}: injected failure"))));
            }
        }
        if let Some(remaining) = script.not_found_failures.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::from(HttpErrorKind::NotFound));
            }
        }
        Ok(())
    }

    fn next_server_id(&self) -> String {
        format!("server-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl<T: Model> HttpAdapter<T> for FakeHttpAdapter<T> {
    async fn find_one(&self, id: &str) -> Result<FindOneOutcome<T>, Error> {
        self.maybe_fail("find_one")?;
        if self.gone.lock().contains(id) {
            return Ok(FindOneOutcome::Gone);
        }
        Ok(match self.rows.lock().get(id).cloned() {
            Some(row) => FindOneOutcome::Found(row),
            None => FindOneOutcome::NotFound,
        })
    }

    async fn find_all(&self, query: Option<&Query>) -> Result<Vec<T>, Error> {
        self.maybe_fail("find_all")?;
        let rows: Vec<T> = self.rows.lock().values().cloned().collect();
        Ok(match query {
            None => rows,
            Some(q) => {
                let json_rows: Vec<serde_json::Value> = rows.iter().filter_map(|r| r.to_json().ok()).collect();
                let matching_ids: std::collections::HashSet<String> = q
                    .clone()
                    .apply(json_rows)
                    .into_iter()
                    .filter_map(|v| v.get("id").and_then(|i| i.as_str()).map(str::to_owned))
                    .collect();
                rows.into_iter().filter(|r| matching_ids.contains(r.id())).collect()
            }
        })
    }

    async fn create_one(&self, entity: &T) -> Result<T, Error> {
        self.maybe_fail("create")?;
        // A real server always assigns its own id for server-generated-id
        // models, ignoring whatever placeholder the client sent.
        let entity = if T::uses_server_generated_id() || entity.id().is_empty() {
            entity.with_id(&self.next_server_id())
        } else {
            entity.clone()
        };
        self.rows.lock().insert(entity.id().to_string(), entity.clone());
        Ok(entity)
    }

    async fn update_one(&self, entity: &T) -> Result<T, Error> {
        self.maybe_fail("update")?;
        if !self.rows.lock().contains_key(entity.id()) {
            return Err(Error::from(HttpErrorKind::NotFound));
        }
        self.rows.lock().insert(entity.id().to_string(), entity.clone());
        Ok(entity.clone())
    }

    async fn replace_one(&self, entity: &T) -> Result<T, Error> {
        self.update_one(entity).await
    }

    async fn delete_one(&self, id: &str) -> Result<(), Error> {
        self.maybe_fail("delete")?;
        if self.rows.lock().remove(id).is_none() {
            return Err(Error::from(HttpErrorKind::NotFound));
        }
        Ok(())
    }
}
