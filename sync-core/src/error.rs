/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::http::HttpErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("the queue is full")]
    QueueFull,

    #[error("a task with this idempotency key is already in flight")]
    Duplicate,

    #[error("the task was cancelled")]
    QueueCancelled,

    #[error("http error: {0}")]
    Http(#[from] HttpErrorKind),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("sync core not initialized")]
    NotInitialized,

    #[error("no repository registered for model type `{0}`")]
    NotRegistered(String),

    #[error("unsupported policy: {0}")]
    UnsupportedPolicy(&'static str),

    #[error("repository has been disposed")]
    Disposed,

    #[error("sync queue entry for {0} has no payload")]
    MissingPayload(String),

    /// A server-assigned id returned by a `create` collided with a
    /// distinct row already stored locally under that id, and the two
    /// couldn't be disambiguated by timestamp (see `id_negotiation`).
    #[error("id negotiation collision for `{0}` could not be resolved by timestamp")]
    IdCollisionUnresolved(String),

    /// An `update` got a 404 and fell back to `create`, which also 404'd.
    #[error("fallback failed (404, 404)")]
    UpdateFallbackFailed,
}

error_support::define_error! {
    ErrorKind {
        (Http, HttpErrorKind),
        (Sql, rusqlite::Error),
        (Json, serde_json::Error),
        (Interrupted, interrupt_support::Interrupted),
    }
}

impl Error {
    /// A short, PII-free label suitable for telemetry and dead-letter
    /// breadcrumbs -- never include the offending id or payload here.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::QueueFull => "queue-full",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::QueueCancelled => "queue-cancelled",
            ErrorKind::Http(HttpErrorKind::NotFound) => "http-not-found",
            ErrorKind::Http(HttpErrorKind::Gone) => "http-gone",
            ErrorKind::Http(HttpErrorKind::Network(_)) => "http-network",
            ErrorKind::Http(HttpErrorKind::Server(_)) => "http-server",
            ErrorKind::Http(HttpErrorKind::Validation(_)) => "http-validation",
            ErrorKind::Sql(_) => "sql",
            ErrorKind::Json(_) => "json",
            ErrorKind::Interrupted(_) => "interrupted",
            ErrorKind::NotInitialized => "not-initialized",
            ErrorKind::NotRegistered(_) => "not-registered",
            ErrorKind::UnsupportedPolicy(_) => "unsupported-policy",
            ErrorKind::Disposed => "disposed",
            ErrorKind::MissingPayload(_) => "missing-payload",
            ErrorKind::IdCollisionUnresolved(_) => "id-collision-unresolved",
            ErrorKind::UpdateFallbackFailed => "update-fallback-failed",
        }
    }

    pub fn is_queue_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::QueueCancelled)
    }

    /// True for transport-level failures a caller should treat as
    /// "still offline", as opposed to a definitive server response.
    pub fn is_network(&self) -> bool {
        matches!(self.kind(), ErrorKind::Http(HttpErrorKind::Network(_)))
    }
}
