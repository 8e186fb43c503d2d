/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The façade a host application actually calls: `save`/`delete` honoring
//! a save policy, `find_one`/`find_all` honoring a load policy, and a
//! reactive change stream, all generic over one `Model` and backed by a
//! `Dao<T>`, an `HttpAdapter<T>` and the shared durable operation log.

use crate::change_stream::{ChangeStream, RepositoryChange};
use crate::config::{Config, LoadPolicy, SavePolicy};
use crate::error::{Error, ErrorKind};
use crate::http::{FindOneOutcome, HttpAdapter};
use crate::id_negotiation;
use crate::model::{Model, Relation};
use crate::queue::{QueueKind, QueueManager};
use crate::refresh;
use crate::registry::{self, DispatchOutcome, RepositoryOps};
use crate::store::sync_queue::{Op, SyncQueueDao, SyncQueueEntry};
use crate::store::{Dao, Filter, Query};
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_guid::Guid;
use tokio::sync::mpsc;

pub struct Repository<T: Model> {
    dao: Arc<dyn Dao<T>>,
    http: Arc<dyn HttpAdapter<T>>,
    conn: Arc<parking_lot::Mutex<Connection>>,
    queue_manager: Arc<QueueManager>,
    changes: ChangeStream<T>,
    config: Config,
    disposed: AtomicBool,
}

impl<T: Model> Repository<T> {
    pub fn new(
        dao: Arc<dyn Dao<T>>,
        http: Arc<dyn HttpAdapter<T>>,
        conn: Arc<parking_lot::Mutex<Connection>>,
        queue_manager: Arc<QueueManager>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            dao,
            http,
            conn,
            queue_manager,
            changes: ChangeStream::new(),
            config,
            disposed: AtomicBool::new(false),
        })
    }

    /// Installs this repository in the process-wide registry so the
    /// retry executor, id negotiation and cascade delete can reach it by
    /// `T::model_type()` alone.
    pub fn register(self: &Arc<Self>)
    where
        Self: RepositoryOps,
    {
        registry::register(self.clone() as Arc<dyn RepositoryOps>);
    }

    fn check_disposed(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::from(ErrorKind::Disposed))
        } else {
            Ok(())
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RepositoryChange<T>> {
        self.changes.subscribe()
    }

    pub fn watch(&self, id: &str) -> tokio::sync::watch::Receiver<Option<T>> {
        self.dao.watch(id)
    }

    pub fn watch_all(&self, query: Query) -> tokio::sync::watch::Receiver<Vec<T>> {
        self.dao.watch_all(query)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.changes.dispose();
        registry::unregister(T::model_type());
    }

    /// Clears this model's local rows. Does not touch the sync queue, so
    /// any pending create/update/delete for this model is untouched and
    /// will be re-materialized locally the next time it dispatches or a
    /// refresh pulls it back down. Emits a single `Deleted("*")` event
    /// rather than one per row.
    pub fn truncate_local(&self) -> Result<(), Error> {
        self.dao.truncate()?;
        self.changes.publish(RepositoryChange::Deleted("*".to_string()));
        Ok(())
    }

    fn ids_with_pending_ops(&self) -> Result<HashSet<String>, Error> {
        let conn = self.conn.lock();
        Ok(SyncQueueDao::get_all(&conn)?
            .into_iter()
            .filter(|e| e.model_type == T::model_type())
            .map(|e| e.model_id)
            .collect())
    }

    pub async fn save(&self, entity: T, policy: Option<SavePolicy>) -> Result<T, Error> {
        self.check_disposed()?;
        match policy.unwrap_or(self.config.default_save_policy) {
            SavePolicy::LocalFirst => self.save_local_first(entity),
            SavePolicy::RemoteFirst => self.save_remote_first(entity).await,
        }
    }

    fn save_local_first(&self, entity: T) -> Result<T, Error> {
        let is_create = self.dao.get(entity.id())?.is_none();
        let (entity, temp_id) = if is_create && T::uses_server_generated_id() && entity.id().is_empty() {
            let temp_id = format!("tmp-{}", Guid::random().as_str());
            (entity.with_id(&temp_id), Some(temp_id))
        } else {
            (entity, None)
        };

        self.dao.put(&entity)?;
        let payload = entity.to_json()?;
        let idempotency_key = Guid::random().as_str().to_string();
        {
            let conn = self.conn.lock();
            if is_create {
                SyncQueueDao::enqueue_create(
                    &conn,
                    T::model_type(),
                    entity.id(),
                    &payload,
                    &idempotency_key,
                    temp_id.as_deref(),
                )?;
            } else {
                SyncQueueDao::enqueue_update(&conn, T::model_type(), entity.id(), &payload, &idempotency_key)?;
            }
        }
        self.changes.publish(if is_create {
            RepositoryChange::Created(entity.clone())
        } else {
            RepositoryChange::Updated(entity.clone())
        });
        Ok(entity)
    }

    async fn save_remote_first(&self, entity: T) -> Result<T, Error> {
        let is_create = self.dao.get(entity.id())?.is_none();
        let http = self.http.clone();
        let remote = if is_create {
            let entity = entity.clone();
            self.queue_manager
                .enqueue(QueueKind::Foreground, None, async move { http.create_one(&entity).await })
                .await?
        } else {
            let entity = entity.clone();
            self.queue_manager
                .enqueue(QueueKind::Foreground, None, async move { http.update_one(&entity).await })
                .await?
        };
        self.dao.put(&remote)?;
        self.changes.publish(if is_create {
            RepositoryChange::Created(remote.clone())
        } else {
            RepositoryChange::Updated(remote.clone())
        });
        Ok(remote)
    }

    pub async fn delete(&self, id: &str, policy: Option<SavePolicy>) -> Result<(), Error> {
        self.check_disposed()?;
        match policy.unwrap_or(self.config.default_save_policy) {
            SavePolicy::LocalFirst => self.delete_local_first(id),
            SavePolicy::RemoteFirst => self.delete_remote_first(id).await,
        }
    }

    fn delete_local_first(&self, id: &str) -> Result<(), Error> {
        let idempotency_key = Guid::random().as_str().to_string();
        {
            let conn = self.conn.lock();
            SyncQueueDao::smart_delete(&conn, T::model_type(), id, &idempotency_key)?;
        }
        self.dao.delete(id)?;
        self.changes.publish(RepositoryChange::Deleted(id.to_string()));
        Ok(())
    }

    async fn delete_remote_first(&self, id: &str) -> Result<(), Error> {
        // If the create that would have put this row on the server never
        // synced, there's nothing to delete remotely -- and calling the
        // adapter anyway would just be a guaranteed 404.
        let pending_create = {
            let conn = self.conn.lock();
            SyncQueueDao::get_for_model(&conn, T::model_type(), id)?
                .into_iter()
                .any(|e| matches!(e.op, Op::Create))
        };

        if !pending_create {
            let http = self.http.clone();
            let owned_id = id.to_string();
            let result = self
                .queue_manager
                .enqueue(QueueKind::Foreground, None, async move { http.delete_one(&owned_id).await })
                .await;
            match result {
                Ok(()) => {}
                Err(e) if matches!(e.kind(), ErrorKind::Http(crate::http::HttpErrorKind::NotFound)) => {}
                Err(e) => return Err(e),
            }
        }

        // The delete already took effect (or was skipped because it never
        // needed to happen); any create/update still queued for this id
        // would otherwise resurrect it on a later retry.
        {
            let conn = self.conn.lock();
            SyncQueueDao::clear_for_model_id(&conn, T::model_type(), id)?;
        }
        self.dao.delete(id)?;
        self.changes.publish(RepositoryChange::Deleted(id.to_string()));
        Ok(())
    }

    pub async fn find_one(&self, id: &str, policy: Option<LoadPolicy>) -> Result<Option<T>, Error> {
        self.check_disposed()?;
        match policy.unwrap_or(self.config.default_load_policy) {
            LoadPolicy::LocalOnly => self.dao.get(id),
            LoadPolicy::LocalThenRemote => {
                let local = self.dao.get(id)?;
                self.refresh_one_in_background(id.to_string());
                Ok(local)
            }
            LoadPolicy::RemoteFirst => self.find_one_remote_first(id).await,
        }
    }

    fn refresh_one_in_background(&self, id: String) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let http = self.http.clone();
        let dao = self.dao.clone();
        // Fire-and-forget: localThenRemote returns the local copy
        // immediately and lets subscribers observe the refreshed value
        // once the network round trip completes.
        let pending = self.ids_with_pending_ops().unwrap_or_default();
        tokio::spawn(async move {
            if pending.contains(&id) {
                return;
            }
            match http.find_one(&id).await {
                Ok(FindOneOutcome::Found(remote)) => {
                    let local = dao.get(&id).ok().flatten();
                    let merged = refresh::merge_one(local, remote);
                    let _ = dao.put(&merged);
                }
                Ok(FindOneOutcome::Gone) => {
                    let _ = dao.delete(&id);
                }
                Ok(FindOneOutcome::NotFound) | Err(_) => {}
            }
        });
    }

    async fn find_one_remote_first(&self, id: &str) -> Result<Option<T>, Error> {
        let http = self.http.clone();
        let owned_id = id.to_string();
        let outcome = self
            .queue_manager
            .enqueue(QueueKind::Load, None, async move { http.find_one(&owned_id).await })
            .await?;
        match outcome {
            FindOneOutcome::Found(remote) => {
                let local = self.dao.get(id)?;
                if self.ids_with_pending_ops()?.contains(id) {
                    // a local write is still queued for this id; let it win
                    // rather than letting a remote-wins merge clobber it.
                    return Ok(local);
                }
                let merged = refresh::merge_one(local, remote);
                self.dao.put(&merged)?;
                self.changes.publish(RepositoryChange::Updated(merged.clone()));
                Ok(Some(merged))
            }
            FindOneOutcome::NotFound => self.dao.get(id),
            FindOneOutcome::Gone => {
                self.dao.delete(id)?;
                self.changes.publish(RepositoryChange::Deleted(id.to_string()));
                Ok(None)
            }
        }
    }

    pub async fn find_all(&self, query: Query, policy: Option<LoadPolicy>) -> Result<Vec<T>, Error> {
        self.check_disposed()?;
        match policy.unwrap_or(self.config.default_load_policy) {
            LoadPolicy::LocalOnly => self.dao.get_all(&query),
            LoadPolicy::LocalThenRemote => {
                let local = self.dao.get_all(&query)?;
                self.refresh_all_in_background(query);
                Ok(local)
            }
            LoadPolicy::RemoteFirst => self.find_all_remote_first(query).await,
        }
    }

    fn refresh_all_in_background(&self, query: Query) {
        let http = self.http.clone();
        let dao = self.dao.clone();
        let pending = self.ids_with_pending_ops().unwrap_or_default();
        tokio::spawn(async move {
            if let Ok(remote) = http.find_all(Some(&query)).await {
                for row in refresh::filter_pending(remote, &pending) {
                    let _ = dao.put(&row);
                }
            }
        });
    }

    async fn find_all_remote_first(&self, query: Query) -> Result<Vec<T>, Error> {
        let http = self.http.clone();
        let q = query.clone();
        let remote = self
            .queue_manager
            .enqueue(QueueKind::Load, None, async move { http.find_all(Some(&q)).await })
            .await?;
        let pending = self.ids_with_pending_ops()?;
        for row in refresh::filter_pending(remote, &pending) {
            self.dao.put(&row)?;
            self.changes.publish(RepositoryChange::Updated(row));
        }
        self.dao.get_all(&query)
    }

    fn entry_entity(&self, entry: &SyncQueueEntry) -> Result<T, Error> {
        let payload = entry
            .payload
            .clone()
            .ok_or_else(|| Error::from(ErrorKind::MissingPayload(entry.model_id.clone())))?;
        T::from_json(payload)
    }
}

#[async_trait]
impl<T: Model> RepositoryOps for Repository<T> {
    fn model_type(&self) -> &'static str {
        T::model_type()
    }

    fn relations(&self) -> &'static [Relation] {
        T::relations()
    }

    async fn dispatch(&self, entry: SyncQueueEntry) -> DispatchOutcome {
        match self.dispatch_inner(entry).await {
            Ok(outcome) => outcome,
            Err(e) => DispatchOutcome::Failed(e),
        }
    }

    fn rewrite_foreign_key(&self, field: &'static str, old_id: &str, new_id: &str) -> Result<(), Error> {
        let query = Query::new().filter(Filter::Eq(field.to_string(), serde_json::Value::String(old_id.to_string())));
        for row in self.dao.get_all(&query)? {
            let mut json = row.to_json()?;
            if let Some(obj) = json.as_object_mut() {
                obj.insert(field.to_string(), serde_json::Value::String(new_id.to_string()));
            }
            let updated = T::from_json(json)?;
            self.dao.put(&updated)?;
        }
        Ok(())
    }

    fn find_children_ids(&self, field: &'static str, parent_id: &str) -> Result<Vec<String>, Error> {
        let query = Query::new().filter(Filter::Eq(field.to_string(), serde_json::Value::String(parent_id.to_string())));
        Ok(self.dao.get_all(&query)?.into_iter().map(|r| r.id().to_string()).collect())
    }

    fn delete_local_cascaded(&self, id: &str) -> Result<(), Error> {
        let idempotency_key = Guid::random().as_str().to_string();
        {
            let conn = self.conn.lock();
            SyncQueueDao::smart_delete(&conn, T::model_type(), id, &idempotency_key)?;
        }
        self.dao.delete(id)?;
        self.changes.publish(RepositoryChange::Deleted(id.to_string()));
        Ok(())
    }

    fn truncate_local(&self) -> Result<(), Error> {
        Repository::truncate_local(self)
    }

    fn notify_sync_error(&self, err: Arc<Error>) {
        self.changes.publish(RepositoryChange::SyncError(err));
    }
}

impl<T: Model> Repository<T> {
    async fn dispatch_inner(&self, entry: SyncQueueEntry) -> Result<DispatchOutcome, Error> {
        match entry.op {
            Op::Create => self.dispatch_create(entry).await,
            Op::Update => self.dispatch_update(entry).await,
            Op::Delete => self.dispatch_delete(entry).await,
        }
    }

    async fn dispatch_create(&self, entry: SyncQueueEntry) -> Result<DispatchOutcome, Error> {
        let entity = self.entry_entity(&entry)?;
        let remote = self.http.create_one(&entity).await?;

        let Some(temp_id) = entry.temporary_client_id.as_deref() else {
            self.dao.put(&remote)?;
            self.changes.publish(RepositoryChange::Updated(remote));
            return Ok(DispatchOutcome::Succeeded);
        };
        if temp_id == remote.id() {
            self.dao.put(&remote)?;
            self.changes.publish(RepositoryChange::Updated(remote));
            return Ok(DispatchOutcome::Succeeded);
        }

        // The server assigned a different id than our placeholder. If a
        // distinct row is already stored locally under that id (e.g. it
        // was synced down by an earlier refresh), this is the id-collision
        // case rather than a plain id assignment, and can't be resolved by
        // a blind rename.
        if let Some(existing) = self.dao.get(remote.id())? {
            return self.resolve_id_collision(temp_id, existing, remote).await;
        }

        self.dao.delete(temp_id)?;
        self.dao.put(&remote)?;
        {
            let conn = self.conn.lock();
            id_negotiation::negotiate(&conn, T::model_type(), T::relations(), temp_id, remote.id())?;
        }
        self.changes.publish(RepositoryChange::IdChanged {
            old_id: temp_id.to_string(),
            new_id: remote.id().to_string(),
        });
        Ok(DispatchOutcome::IdAssigned {
            old_id: temp_id.to_string(),
            new_id: remote.id().to_string(),
        })
    }

    /// Implements the id-collision branch of id negotiation: the
    /// server-assigned id already names a distinct local row. Keep the
    /// row with the newer `updated_at_millis`, overwrite its fields onto
    /// the negotiated server id, and drop the temporary row -- dependents
    /// still only ever referenced `temp_id`, so the foreign-key rewrite is
    /// the same `temp_id -> remote.id()` as the non-colliding case. If
    /// timestamps don't disambiguate a winner, leave both rows in place
    /// and fail the dispatch so the entry stays pending for the next retry.
    async fn resolve_id_collision(&self, temp_id: &str, existing: T, remote: T) -> Result<DispatchOutcome, Error> {
        let survivor = match (existing.updated_at_millis(), remote.updated_at_millis()) {
            (Some(e), Some(r)) if e > r => existing,
            (Some(e), Some(r)) if r > e => remote.clone(),
            _ => {
                log::warn!(
                    "id negotiation collision for {}: server id `{}` already used locally \
                     and timestamps don't disambiguate a winner; keeping both rows, entry stays pending",
                    T::model_type(),
                    remote.id(),
                );
                return Err(Error::from(ErrorKind::IdCollisionUnresolved(remote.id().to_string())));
            }
        };
        let survivor = survivor.with_id(remote.id());
        self.dao.delete(temp_id)?;
        self.dao.put(&survivor)?;
        {
            let conn = self.conn.lock();
            id_negotiation::negotiate(&conn, T::model_type(), T::relations(), temp_id, remote.id())?;
        }
        self.changes.publish(RepositoryChange::IdChanged {
            old_id: temp_id.to_string(),
            new_id: remote.id().to_string(),
        });
        Ok(DispatchOutcome::IdAssigned {
            old_id: temp_id.to_string(),
            new_id: remote.id().to_string(),
        })
    }

    async fn dispatch_update(&self, entry: SyncQueueEntry) -> Result<DispatchOutcome, Error> {
        let entity = self.entry_entity(&entry)?;
        let remote = match self.http.update_one(&entity).await {
            Ok(remote) => remote,
            Err(e) if matches!(e.kind(), ErrorKind::Http(crate::http::HttpErrorKind::NotFound)) => {
                log::warn!(
                    "update for {}/{} got 404, falling back to create",
                    T::model_type(),
                    entry.model_id
                );
                match self.http.create_one(&entity).await {
                    Ok(remote) => remote,
                    Err(e) if matches!(e.kind(), ErrorKind::Http(crate::http::HttpErrorKind::NotFound)) => {
                        return Err(Error::from(ErrorKind::UpdateFallbackFailed));
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        self.dao.put(&remote)?;
        self.changes.publish(RepositoryChange::Updated(remote));
        Ok(DispatchOutcome::Succeeded)
    }

    async fn dispatch_delete(&self, entry: SyncQueueEntry) -> Result<DispatchOutcome, Error> {
        match self.http.delete_one(&entry.model_id).await {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::Http(crate::http::HttpErrorKind::NotFound)) => {
                log::debug!(
                    "delete for {}/{} got 404, treating as already deleted",
                    T::model_type(),
                    entry.model_id
                );
            }
            Err(e) => return Err(e),
        }
        Ok(DispatchOutcome::Succeeded)
    }
}
