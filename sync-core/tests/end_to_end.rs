/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::Connection;
use serde_json::json;
use std::sync::Arc;
use sync_core::config::Config;
use sync_core::error::Error;
use sync_core::model::{Model, Relation};
use sync_core::queue::retry_executor::RetryExecutor;
use sync_core::queue::QueueManager;
use sync_core::registry;
use sync_core::repository::Repository;
use sync_core::store::MemoryDao;
use sync_core::testing::FakeHttpAdapter;

#[derive(Debug, Clone, PartialEq)]
struct Task {
    id: String,
    title: String,
}

impl Model for Task {
    fn model_type() -> &'static str {
        "task"
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn with_id(&self, new_id: &str) -> Self {
        Task {
            id: new_id.to_string(),
            title: self.title.clone(),
        }
    }
    fn to_json(&self) -> Result<serde_json::Value, Error> {
        Ok(json!({"id": self.id, "title": self.title}))
    }
    fn from_json(v: serde_json::Value) -> Result<Self, Error> {
        Ok(Task {
            id: v["id"].as_str().unwrap_or_default().to_string(),
            title: v["title"].as_str().unwrap_or_default().to_string(),
        })
    }
    fn uses_server_generated_id() -> bool {
        true
    }
    fn relations() -> &'static [Relation] {
        &[Relation {
            child_type: "comment",
            foreign_key_field: "task_id",
            cascade_delete: true,
        }]
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Comment {
    id: String,
    task_id: String,
    body: String,
}

impl Model for Comment {
    fn model_type() -> &'static str {
        "comment"
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn with_id(&self, new_id: &str) -> Self {
        Comment {
            id: new_id.to_string(),
            task_id: self.task_id.clone(),
            body: self.body.clone(),
        }
    }
    fn to_json(&self) -> Result<serde_json::Value, Error> {
        Ok(json!({"id": self.id, "task_id": self.task_id, "body": self.body}))
    }
    fn from_json(v: serde_json::Value) -> Result<Self, Error> {
        Ok(Comment {
            id: v["id"].as_str().unwrap_or_default().to_string(),
            task_id: v["task_id"].as_str().unwrap_or_default().to_string(),
            body: v["body"].as_str().unwrap_or_default().to_string(),
        })
    }
    fn uses_server_generated_id() -> bool {
        false
    }
}

fn setup_conn() -> Arc<parking_lot::Mutex<Connection>> {
    let conn = Connection::open_in_memory().unwrap();
    sync_core::init_schema(&conn).unwrap();
    Arc::new(parking_lot::Mutex::new(conn))
}

fn task_repo(
    conn: Arc<parking_lot::Mutex<Connection>>,
    queue_manager: Arc<QueueManager>,
    http: Arc<FakeHttpAdapter<Task>>,
) -> Arc<Repository<Task>> {
    let dao = MemoryDao::<Task>::new();
    let repo = Repository::new(dao, http, conn, queue_manager, Config::default());
    repo.register();
    repo
}

fn comment_repo(
    conn: Arc<parking_lot::Mutex<Connection>>,
    queue_manager: Arc<QueueManager>,
    http: Arc<FakeHttpAdapter<Comment>>,
) -> Arc<Repository<Comment>> {
    let dao = MemoryDao::<Comment>::new();
    let repo = Repository::new(dao, http, conn, queue_manager, Config::default());
    repo.register();
    repo
}

#[tokio::test]
async fn coalescing_collapses_rapid_saves_into_one_queue_entry() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());

    let t1 = repo
        .save(
            Task {
                id: String::new(),
                title: "first".into(),
            },
            None,
        )
        .await
        .unwrap();
    let t2 = repo.save(Task { id: t1.id.clone(), title: "second".into() }, None).await.unwrap();

    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_all(&conn).unwrap()
    };
    assert_eq!(entries.len(), 1, "coalesced create+update should leave one queue row");
    assert_eq!(entries[0].payload.as_ref().unwrap()["title"], "second");
    assert_eq!(t2.title, "second");
}

#[tokio::test]
async fn delete_before_create_syncs_drops_all_history() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    // force the create to fail so it never reaches the server before the delete
    http.fail_next("create", 100);
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());

    let created = repo
        .save(
            Task {
                id: String::new(),
                title: "will be deleted".into(),
            },
            None,
        )
        .await
        .unwrap();
    repo.delete(&created.id, None).await.unwrap();

    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_all(&conn).unwrap()
    };
    assert!(entries.is_empty(), "deleting a never-synced create must drop its queue row entirely");
    assert!(http.find_one(&created.id).await.unwrap().is_not_found());
}

#[tokio::test]
async fn create_fail_then_remote_first_delete_drops_the_pending_create() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    // force the create to fail so it never reaches the server before the delete
    http.fail_next("create", 100);
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());

    let created = repo
        .save(
            Task {
                id: "m1".into(),
                title: "v42".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(created.id, "m1");

    let entries_after_save = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_for_model(&conn, "task", "m1").unwrap()
    };
    assert_eq!(entries_after_save.len(), 1, "the failed create should still be queued for retry");

    repo.delete("m1", Some(sync_core::SavePolicy::RemoteFirst)).await.unwrap();

    let entries_after_delete = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_for_model(&conn, "task", "m1").unwrap()
    };
    assert!(
        entries_after_delete.is_empty(),
        "a remoteFirst delete of a never-synced create must leave no queue entries behind"
    );
    assert!(http.find_one("m1").await.unwrap().is_not_found());
}

trait FindOneOutcomeExt {
    fn is_not_found(&self) -> bool;
}
impl<T> FindOneOutcomeExt for sync_core::http::FindOneOutcome<T> {
    fn is_not_found(&self) -> bool {
        matches!(self, sync_core::http::FindOneOutcome::NotFound)
    }
}

#[tokio::test]
async fn update_falls_back_to_create_on_404() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());
    let executor = RetryExecutor::new(conn.clone(), qm.clone(), &Config::default());

    // seed a row that exists locally but not on the (fake) server, then
    // queue an update for it directly so dispatch sees an Update op.
    let payload = json!({"id": "ghost-1", "title": "edited"});
    {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::enqueue_update(
            &conn, "task", "ghost-1", &payload, "k-update-404",
        )
        .unwrap();
    }

    let processed = executor.process_due_tasks_now(true).await.unwrap();
    assert_eq!(processed, 1);

    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_all(&conn).unwrap()
    };
    assert!(entries.is_empty(), "the fallback create should have succeeded and cleared the queue row");
    let on_server = http.find_one("ghost-1").await.unwrap();
    assert!(matches!(on_server, sync_core::http::FindOneOutcome::Found(_)));
    drop(repo);
}

#[tokio::test]
async fn update_fallback_404_dead_letters_with_diagnostic_message_and_notifies() {
    registry::clear_for_test();
    let conn = setup_conn();
    // max_attempts: 1 so the first failed dispatch dead-letters immediately.
    let config = Config { max_attempts: 1, ..Config::default() };
    let qm = QueueManager::new(&config);
    let http = FakeHttpAdapter::<Task>::new();
    // the update 404s (row was never seeded on the fake server), and the
    // create it falls back to 404s too.
    http.fail_next_not_found("create", 1);
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());
    let executor = RetryExecutor::new(conn.clone(), qm.clone(), &config);

    let reporter = Arc::new(error_support::TestErrorReporter::new());
    error_support::set_application_error_reporter(Box::new(error_support::ArcReporterAdapter::new(reporter.clone())));

    let mut changes = repo.subscribe();

    let payload = json!({"id": "ghost-2", "title": "edited"});
    {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::enqueue_update(
            &conn, "task", "ghost-2", &payload, "k-update-404-404",
        )
        .unwrap();
    }

    let processed = executor.process_due_tasks_now(true).await.unwrap();
    assert_eq!(processed, 1);

    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_for_model(&conn, "task", "ghost-2").unwrap()
    };
    assert_eq!(entries[0].status, sync_core::store::sync_queue::QueueStatus::Dead);
    assert_eq!(entries[0].last_error.as_deref(), Some("fallback failed (404, 404)"));

    let change = changes.try_recv().expect("a SyncError change should have been published");
    match change {
        sync_core::change_stream::RepositoryChange::SyncError(err) => {
            assert_eq!(err.to_string(), "fallback failed (404, 404)");
        }
        other => panic!("expected SyncError, got {other:?}"),
    }

    let reported = reporter.get_errors();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, "task");
    assert_eq!(reported[0].1, "fallback failed (404, 404)");

    error_support::unset_application_error_reporter();
    drop(repo);
}

#[tokio::test]
async fn remote_first_find_does_not_clobber_a_pending_local_write() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Comment>::new();
    http.seed(Comment {
        id: "p1".into(),
        task_id: "t1".into(),
        body: "remote-old".into(),
    });
    let repo = comment_repo(conn.clone(), qm.clone(), http.clone());

    // localFirst save leaves a pending `create` queued (no updated_at_millis
    // on Comment, so a naive merge would always take the remote copy).
    let saved = repo
        .save(
            Comment {
                id: "p1".into(),
                task_id: "t1".into(),
                body: "local-new".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(saved.body, "local-new");

    let found = repo
        .find_one("p1", Some(sync_core::LoadPolicy::RemoteFirst))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.body, "local-new", "a pending local write must win over a remoteFirst read");
}

#[tokio::test]
async fn id_negotiation_rewrites_dependent_foreign_keys() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let task_http = FakeHttpAdapter::<Task>::new();
    let comment_http = FakeHttpAdapter::<Comment>::new();
    let tasks = task_repo(conn.clone(), qm.clone(), task_http.clone());
    let comments = comment_repo(conn.clone(), qm.clone(), comment_http.clone());
    let executor = RetryExecutor::new(conn.clone(), qm.clone(), &Config::default());

    let task = tasks
        .save(
            Task {
                id: String::new(),
                title: "parent".into(),
            },
            None,
        )
        .await
        .unwrap();
    let temp_task_id = task.id.clone();
    assert!(temp_task_id.starts_with("tmp-"));

    let comment = comments
        .save(
            Comment {
                id: "c1".into(),
                task_id: temp_task_id.clone(),
                body: "hi".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(comment.task_id, temp_task_id);

    // drive the task's create to completion, which should trigger id negotiation
    executor.process_due_tasks_now(true).await.unwrap();

    let rewritten = comments.watch("c1").borrow().clone().unwrap();
    assert_ne!(rewritten.task_id, temp_task_id);
    assert!(rewritten.task_id.starts_with("server-"));
}

#[tokio::test]
async fn cascade_delete_removes_dependents_and_tolerates_a_cycle() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let task_http = FakeHttpAdapter::<Task>::new();
    let comment_http = FakeHttpAdapter::<Comment>::new();
    let tasks = task_repo(conn.clone(), qm.clone(), task_http.clone());
    let comments = comment_repo(conn.clone(), qm.clone(), comment_http.clone());

    let task = tasks
        .save(
            Task {
                id: "t1".into(),
                title: "parent".into(),
            },
            None,
        )
        .await
        .unwrap();
    comments
        .save(
            Comment {
                id: "c1".into(),
                task_id: task.id.clone(),
                body: "hi".into(),
            },
            None,
        )
        .await
        .unwrap();

    sync_core::cascade::cascade_delete("task", &task.id).unwrap();

    assert!(tasks.watch(&task.id).borrow().is_none());
    assert!(comments.watch("c1").borrow().is_none());

    // re-running the cascade (e.g. a retried delete) must not panic even
    // though the rows are already gone.
    sync_core::cascade::cascade_delete("task", &task.id).unwrap();
}

#[tokio::test]
async fn truncate_local_clears_dao_but_leaves_queue_intact() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    http.fail_next("create", 100);
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());

    let created = repo
        .save(
            Task {
                id: String::new(),
                title: "never synced".into(),
            },
            None,
        )
        .await
        .unwrap();

    repo.truncate_local().unwrap();

    assert!(repo
        .find_one(&created.id, Some(sync_core::LoadPolicy::LocalOnly))
        .await
        .unwrap()
        .is_none());
    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_all(&conn).unwrap()
    };
    assert_eq!(entries.len(), 1, "truncateLocal must not touch the sync queue");
}

#[tokio::test]
async fn obliterate_local_storage_clears_data_and_queue_but_keeps_registration() {
    registry::clear_for_test();
    let conn = setup_conn();
    let qm = QueueManager::new(&Config::default());
    let http = FakeHttpAdapter::<Task>::new();
    http.fail_next("create", 100);
    let repo = task_repo(conn.clone(), qm.clone(), http.clone());
    let executor = RetryExecutor::new(conn.clone(), qm.clone(), &Config::default());

    let created = repo
        .save(
            Task {
                id: String::new(),
                title: "will be obliterated".into(),
            },
            None,
        )
        .await
        .unwrap();

    sync_core::obliterate_local_storage(&conn.lock(), &qm, &executor).unwrap();

    assert!(repo.watch(&created.id).borrow().is_none());
    let entries = {
        let conn = conn.lock();
        sync_core::store::sync_queue::SyncQueueDao::get_all(&conn).unwrap()
    };
    assert!(entries.is_empty(), "obliterate must drop the durable operation log too");

    // the registration itself survives: a fresh save still works.
    let again = repo
        .save(
            Task {
                id: String::new(),
                title: "after obliterate".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(again.title, "after obliterate");
}
