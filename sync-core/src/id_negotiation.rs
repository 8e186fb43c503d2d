/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Replaces a locally generated temporary client id with the
//! server-assigned id once a `create` task for a server-id model
//! succeeds, rewriting every place that temporary id was referenced: the
//! entity's own row, any other not-yet-synced queue entries for the same
//! row, and -- via the registry -- dependent rows in other models that
//! pointed at it through a `Relation`.

use crate::error::Error;
use crate::model::Relation;
use crate::registry;
use crate::store::sync_queue::SyncQueueDao;
use rusqlite::Connection;

/// Rewrites every reference to `old_id` across the queue and dependent
/// models after `model_type`'s own row has already been rewritten by its
/// repository (which owns the typed `Dao` and so must do that part
/// itself before calling this).
pub fn negotiate(
    conn: &Connection,
    model_type: &'static str,
    relations: &'static [Relation],
    old_id: &str,
    new_id: &str,
) -> Result<(), Error> {
    SyncQueueDao::update_model_id(conn, model_type, old_id, new_id)?;
    rewrite_queued_payloads(conn, model_type, old_id, new_id)?;

    for rel in relations {
        rewrite_queued_foreign_keys(conn, rel, old_id, new_id)?;
        if let Some(child) = registry::lookup(rel.child_type) {
            child.rewrite_foreign_key(rel.foreign_key_field, old_id, new_id)?;
        } else {
            log::warn!(
                "id negotiation: no repository registered for dependent type `{}`, \
                 durable queue entries were still rewritten",
                rel.child_type
            );
        }
    }
    Ok(())
}

fn rewrite_queued_payloads(
    conn: &Connection,
    model_type: &str,
    old_id: &str,
    new_id: &str,
) -> Result<(), Error> {
    for row in SyncQueueDao::get_for_model(conn, model_type, new_id)? {
        if let Some(mut payload) = row.payload {
            if let Some(obj) = payload.as_object_mut() {
                if obj.get("id").and_then(|v| v.as_str()) == Some(old_id) {
                    obj.insert("id".to_string(), serde_json::Value::String(new_id.to_string()));
                    SyncQueueDao::set_payload(conn, row.id, &payload)?;
                }
            }
        }
    }
    Ok(())
}

fn rewrite_queued_foreign_keys(
    conn: &Connection,
    rel: &Relation,
    old_id: &str,
    new_id: &str,
) -> Result<(), Error> {
    for row in SyncQueueDao::get_all(conn)? {
        if row.model_type != rel.child_type {
            continue;
        }
        if let Some(mut payload) = row.payload {
            if let Some(obj) = payload.as_object_mut() {
                if obj.get(rel.foreign_key_field).and_then(|v| v.as_str()) == Some(old_id) {
                    obj.insert(
                        rel.foreign_key_field.to_string(),
                        serde_json::Value::String(new_id.to_string()),
                    );
                    SyncQueueDao::set_payload(conn, row.id, &payload)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sync_queue;
    use serde_json::json;

    #[test]
    fn rewrites_queued_payload_id_and_fk_refs() {
        let conn = Connection::open_in_memory().unwrap();
        sync_queue::init(&conn).unwrap();
        SyncQueueDao::enqueue_create(
            &conn,
            "task",
            "tmp-1",
            &json!({"id": "tmp-1", "title": "x"}),
            "k1",
            Some("tmp-1"),
        )
        .unwrap();
        SyncQueueDao::enqueue_create(
            &conn,
            "comment",
            "c1",
            &json!({"id": "c1", "task_id": "tmp-1"}),
            "k2",
            None,
        )
        .unwrap();

        let relations: &'static [Relation] = &[Relation {
            child_type: "comment",
            foreign_key_field: "task_id",
            cascade_delete: true,
        }];
        negotiate(&conn, "task", relations, "tmp-1", "server-1").unwrap();

        let task_rows = SyncQueueDao::get_for_model(&conn, "task", "server-1").unwrap();
        assert_eq!(task_rows.len(), 1);
        assert_eq!(task_rows[0].payload.as_ref().unwrap()["id"], "server-1");

        let comment_rows = SyncQueueDao::get_for_model(&conn, "comment", "c1").unwrap();
        assert_eq!(comment_rows[0].payload.as_ref().unwrap()["task_id"], "server-1");
    }
}
