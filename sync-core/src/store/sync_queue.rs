/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The durable operation log. Unlike per-entity DAOs, this schema is fixed
//! and owned by this crate -- every queued create/update/delete against
//! every model type lives in one `sync_queue` table, coalesced and replayed
//! by the retry executor. The table layout and coalescing rules mirror the
//! `local_changes`/`sync_kv` design sketched in the retrieval pack's
//! `oplog.rs` reference, adapted to this crate's three-queue scheduler and
//! id-negotiation requirements.

use crate::error::Error;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sql_support::ConnExt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "create" => Op::Create,
            "update" => Op::Update,
            "delete" => Op::Delete,
            _ => unreachable!("CHECK constraint guarantees one of the three values"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    InProgress,
    Dead,
}

impl QueueStatus {
    fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Dead => "dead",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "pending" => QueueStatus::Pending,
            "in_progress" => QueueStatus::InProgress,
            "dead" => QueueStatus::Dead,
            _ => unreachable!("CHECK constraint guarantees one of the three values"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub model_type: String,
    pub model_id: String,
    pub op: Op,
    pub payload: Option<serde_json::Value>,
    pub idempotency_key: String,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub last_error_is_network: bool,
    pub temporary_client_id: Option<String>,
    pub created_at: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before 1970")
        .as_millis() as i64
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let payload: Option<String> = row.get("payload")?;
    Ok(SyncQueueEntry {
        id: row.get("id")?,
        model_type: row.get("model_type")?,
        model_id: row.get("model_id")?,
        op: Op::from_str(&row.get::<_, String>("op")?),
        payload: payload.map(|p| serde_json::from_str(&p)).transpose().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        idempotency_key: row.get("idempotency_key")?,
        status: QueueStatus::from_str(&row.get::<_, String>("status")?),
        attempt_count: row.get("attempt_count")?,
        next_retry_at: row.get("next_retry_at")?,
        last_error: row.get("last_error")?,
        last_error_is_network: row.get::<_, i64>("last_error_is_network")? != 0,
        temporary_client_id: row.get("temporary_client_id")?,
        created_at: row.get("created_at")?,
    })
}

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_queue (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    model_type              TEXT NOT NULL,
    model_id                TEXT NOT NULL,
    op                      TEXT NOT NULL CHECK(op IN ('create', 'update', 'delete')),
    payload                 TEXT,
    idempotency_key         TEXT NOT NULL UNIQUE,
    status                  TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'in_progress', 'dead')),
    attempt_count           INTEGER NOT NULL DEFAULT 0,
    next_retry_at           INTEGER NOT NULL DEFAULT 0,
    last_error              TEXT,
    last_error_is_network   INTEGER NOT NULL DEFAULT 0,
    temporary_client_id     TEXT,
    created_at              INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_queue_due ON sync_queue(status, next_retry_at, last_error_is_network, id);
CREATE INDEX IF NOT EXISTS idx_sync_queue_model ON sync_queue(model_type, model_id);
";

pub fn init(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Computes the decorrelated-jitter backoff for the *next* attempt, given
/// how many attempts have already failed. `attempt_count == 1` means "one
/// failure has just been recorded"; the first retry therefore always
/// lands somewhere in `[base, base*3]`.
pub fn backoff_delay(
    attempt_count: u32,
    base: std::time::Duration,
    cap: std::time::Duration,
) -> std::time::Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let cap_ms = cap.as_millis() as u64;
    let prev_ms = base_ms.saturating_mul(1u64 << attempt_count.saturating_sub(1).min(32));
    let hi = prev_ms.saturating_mul(3).min(cap_ms).max(base_ms);
    let delay_ms = rand::thread_rng().gen_range(base_ms..=hi).min(cap_ms);
    std::time::Duration::from_millis(delay_ms)
}

pub struct SyncQueueDao;

impl SyncQueueDao {
    /// Enqueues a `create`, coalescing with any still-pending `create` for
    /// the same `(model_type, model_id)` by overwriting its payload rather
    /// than inserting a second row.
    pub fn enqueue_create(
        conn: &Connection,
        model_type: &str,
        model_id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
        temporary_client_id: Option<&str>,
    ) -> Result<i64, Error> {
        if let Some(existing) = Self::find_active(conn, model_type, model_id, Op::Create)? {
            log::trace!("coalescing create into sync_queue entry {}", existing.id);
            conn.execute(
                "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
                params![payload.to_string(), existing.id],
            )?;
            return Ok(existing.id);
        }
        conn.execute(
            "INSERT INTO sync_queue
                (model_type, model_id, op, payload, idempotency_key, temporary_client_id, created_at)
             VALUES (?1, ?2, 'create', ?3, ?4, ?5, ?6)",
            params![
                model_type,
                model_id,
                payload.to_string(),
                idempotency_key,
                temporary_client_id,
                now_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enqueues an `update`. If an active `create` exists for the same
    /// row, its payload is overwritten in place (the row hasn't reached
    /// the server yet, so there is nothing to "update"). Otherwise
    /// coalesces with any active `update`, else inserts a new row.
    pub fn enqueue_update(
        conn: &Connection,
        model_type: &str,
        model_id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<i64, Error> {
        if let Some(existing) = Self::find_active(conn, model_type, model_id, Op::Create)? {
            log::trace!(
                "coalescing update into pending create, sync_queue entry {}",
                existing.id
            );
            conn.execute(
                "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
                params![payload.to_string(), existing.id],
            )?;
            return Ok(existing.id);
        }
        if let Some(existing) = Self::find_active(conn, model_type, model_id, Op::Update)? {
            log::trace!("coalescing update into sync_queue entry {}", existing.id);
            conn.execute(
                "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
                params![payload.to_string(), existing.id],
            )?;
            return Ok(existing.id);
        }
        conn.execute(
            "INSERT INTO sync_queue
                (model_type, model_id, op, payload, idempotency_key, created_at)
             VALUES (?1, ?2, 'update', ?3, ?4, ?5)",
            params![
                model_type,
                model_id,
                payload.to_string(),
                idempotency_key,
                now_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enqueues a `delete`. If the row never reached the server (an active
    /// `create` is still pending), the whole history for this row is
    /// simply dropped and `true` is returned to tell the caller no network
    /// task is needed. Otherwise any pending `update` is discarded and a
    /// `delete` row is inserted.
    pub fn smart_delete(
        conn: &Connection,
        model_type: &str,
        model_id: &str,
        idempotency_key: &str,
    ) -> Result<bool, Error> {
        if let Some(existing) = Self::find_active(conn, model_type, model_id, Op::Create)? {
            log::debug!(
                "smart-delete: dropping never-synced create, sync_queue entry {}",
                existing.id
            );
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![existing.id])?;
            return Ok(true);
        }
        if let Some(existing) = Self::find_active(conn, model_type, model_id, Op::Update)? {
            log::debug!(
                "smart-delete: dropping superseded update, sync_queue entry {}",
                existing.id
            );
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![existing.id])?;
        }
        conn.execute(
            "INSERT INTO sync_queue
                (model_type, model_id, op, payload, idempotency_key, created_at)
             VALUES (?1, ?2, 'delete', NULL, ?3, ?4)",
            params![model_type, model_id, idempotency_key, now_millis()],
        )?;
        Ok(false)
    }

    fn find_active(
        conn: &Connection,
        model_type: &str,
        model_id: &str,
        op: Op,
    ) -> Result<Option<SyncQueueEntry>, Error> {
        Ok(conn
            .query_row(
                "SELECT * FROM sync_queue
                 WHERE model_type = ?1 AND model_id = ?2 AND op = ?3 AND status != 'dead'
                 LIMIT 1",
                params![model_type, model_id, op.as_str()],
                row_to_entry,
            )
            .optional()?)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<SyncQueueEntry>, Error> {
        Ok(conn
            .query_row("SELECT * FROM sync_queue WHERE id = ?1", params![id], row_to_entry)
            .optional()?)
    }

    pub fn get_all(conn: &Connection) -> Result<Vec<SyncQueueEntry>, Error> {
        conn.query_rows_and_then("SELECT * FROM sync_queue ORDER BY id ASC", [], row_to_entry)
            .map_err(Error::from)
    }

    /// Drops every queued operation for one row. Used by a `remoteFirst`
    /// delete, which performs the network call itself rather than handing
    /// it to the queue, so any create/update still pending for this id
    /// must be discarded rather than replayed later.
    pub fn clear_for_model_id(conn: &Connection, model_type: &str, model_id: &str) -> Result<(), Error> {
        conn.execute(
            "DELETE FROM sync_queue WHERE model_type = ?1 AND model_id = ?2",
            params![model_type, model_id],
        )?;
        Ok(())
    }

    /// Drops every queued operation for every model. Used only by
    /// `obliterate_local_storage`; a single repository's `truncateLocal()`
    /// must never reach this, since it leaves the queue intact by design.
    pub fn truncate(conn: &Connection) -> Result<(), Error> {
        conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }

    pub fn get_for_model(
        conn: &Connection,
        model_type: &str,
        model_id: &str,
    ) -> Result<Vec<SyncQueueEntry>, Error> {
        conn.query_rows_and_then(
            "SELECT * FROM sync_queue WHERE model_type = ?1 AND model_id = ?2 ORDER BY id ASC",
            params![model_type, model_id],
            row_to_entry,
        )
        .map_err(Error::from)
    }

    /// Tasks due to run now, ordered so earliest-due work runs first, ties
    /// broken in insertion order, and -- among tasks due at the exact same
    /// instant -- network-error backoffs deprioritized behind everything
    /// else (they're the likeliest to fail again while still offline).
    pub fn get_due_tasks(conn: &Connection, now: i64, limit: usize) -> Result<Vec<SyncQueueEntry>, Error> {
        conn.query_rows_and_then(
            "SELECT * FROM sync_queue
             WHERE status = 'pending' AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC, last_error_is_network ASC, id ASC
             LIMIT ?2",
            params![now, limit as i64],
            row_to_entry,
        )
        .map_err(Error::from)
    }

    pub fn mark_in_progress(conn: &Connection, id: i64) -> Result<(), Error> {
        conn.execute(
            "UPDATE sync_queue SET status = 'in_progress' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_succeeded(conn: &Connection, id: i64) -> Result<(), Error> {
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn mark_failed(
        conn: &Connection,
        id: i64,
        error_message: &str,
        is_network: bool,
        max_attempts: u32,
        base_delay: std::time::Duration,
        max_delay: std::time::Duration,
    ) -> Result<QueueStatus, Error> {
        let attempt_count: u32 = conn.query_row(
            "SELECT attempt_count FROM sync_queue WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let attempt_count = attempt_count + 1;
        let status = if attempt_count >= max_attempts {
            log::warn!(
                "dead-lettering sync_queue entry {} after {} attempts: {}",
                id,
                attempt_count,
                error_message
            );
            QueueStatus::Dead
        } else {
            QueueStatus::Pending
        };
        let next_retry_at = now_millis()
            + backoff_delay(attempt_count, base_delay, max_delay).as_millis() as i64;
        conn.execute(
            "UPDATE sync_queue
             SET status = ?1, attempt_count = ?2, next_retry_at = ?3,
                 last_error = ?4, last_error_is_network = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                attempt_count,
                next_retry_at,
                error_message,
                is_network as i64,
                id
            ],
        )?;
        Ok(status)
    }

    pub fn update_model_id(
        conn: &Connection,
        model_type: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<(), Error> {
        conn.execute(
            "UPDATE sync_queue SET model_id = ?1 WHERE model_type = ?2 AND model_id = ?3",
            params![new_id, model_type, old_id],
        )?;
        Ok(())
    }

    pub fn set_payload(conn: &Connection, id: i64, payload: &serde_json::Value) -> Result<(), Error> {
        conn.execute(
            "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
            params![payload.to_string(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn
    }

    #[test]
    fn create_then_update_coalesces() {
        let conn = setup();
        SyncQueueDao::enqueue_create(&conn, "task", "1", &json!({"title": "a"}), "k1", None).unwrap();
        SyncQueueDao::enqueue_update(&conn, "task", "1", &json!({"title": "b"}), "k2").unwrap();
        let all = SyncQueueDao::get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].op, Op::Create);
        assert_eq!(all[0].payload.as_ref().unwrap()["title"], "b");
    }

    #[test]
    fn delete_after_unsynced_create_drops_history() {
        let conn = setup();
        SyncQueueDao::enqueue_create(&conn, "task", "1", &json!({"title": "a"}), "k1", None).unwrap();
        let dropped = SyncQueueDao::smart_delete(&conn, "task", "1", "k2").unwrap();
        assert!(dropped);
        assert!(SyncQueueDao::get_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn delete_after_synced_update_enqueues_delete() {
        let conn = setup();
        let create_id =
            SyncQueueDao::enqueue_create(&conn, "task", "1", &json!({"title": "a"}), "k1", None).unwrap();
        // simulate the create having already synced and left the queue
        SyncQueueDao::mark_succeeded(&conn, create_id).unwrap();
        SyncQueueDao::enqueue_update(&conn, "task", "1", &json!({"title": "b"}), "k2").unwrap();
        let dropped = SyncQueueDao::smart_delete(&conn, "task", "1", "k3").unwrap();
        assert!(!dropped);
        let all = SyncQueueDao::get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].op, Op::Delete);
    }

    #[test]
    fn due_tasks_deprioritize_network_errors_at_same_retry_time() {
        let conn = setup();
        let a = SyncQueueDao::enqueue_create(&conn, "task", "1", &json!({}), "k1", None).unwrap();
        let b = SyncQueueDao::enqueue_create(&conn, "task", "2", &json!({}), "k2", None).unwrap();
        conn.execute(
            "UPDATE sync_queue SET last_error_is_network = 1 WHERE id = ?1",
            params![a],
        )
        .unwrap();
        let due = SyncQueueDao::get_due_tasks(&conn, now_millis() + 1, 10).unwrap();
        assert_eq!(due[0].id, b);
        assert_eq!(due[1].id, a);
    }

    #[test]
    fn mark_failed_dead_letters_after_max_attempts() {
        let conn = setup();
        let id = SyncQueueDao::enqueue_create(&conn, "task", "1", &json!({}), "k1", None).unwrap();
        let mut status = QueueStatus::Pending;
        for _ in 0..5 {
            status = SyncQueueDao::mark_failed(
                &conn,
                id,
                "boom",
                false,
                5,
                std::time::Duration::from_millis(1),
                std::time::Duration::from_secs(1),
            )
            .unwrap();
        }
        assert_eq!(status, QueueStatus::Dead);
    }
}
