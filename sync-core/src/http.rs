/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The network-facing trait the retry executor and repository drive
//! operations through. Modeled on `viaduct`'s `Backend` trait: an
//! `async_trait` seam so a host can plug in whatever HTTP stack it likes
//! (hyper, a platform networking bridge, a test double) without this crate
//! caring about wire formats or transport.

use crate::error::Error;
use crate::model::Model;
use crate::store::Query;
use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpErrorKind {
    #[error("not found")]
    NotFound,
    #[error("gone")]
    Gone,
    #[error("network error: {0}")]
    Network(String),
    #[error("server error (status {0})")]
    Server(u16),
    #[error("validation error (status {0}): {1}")]
    Validation(u16, String),
}

/// Outcome of a remote `findOne`, distinguishing "absent" (404, treat as a
/// normal miss) from "gone" (410, a tombstone the caller should act on).
#[derive(Debug, Clone)]
pub enum FindOneOutcome<T> {
    Found(T),
    NotFound,
    Gone,
}

#[async_trait]
pub trait HttpAdapter<T: Model>: Send + Sync {
    async fn find_one(&self, id: &str) -> Result<FindOneOutcome<T>, Error>;
    async fn find_all(&self, query: Option<&Query>) -> Result<Vec<T>, Error>;
    async fn create_one(&self, entity: &T) -> Result<T, Error>;
    async fn update_one(&self, entity: &T) -> Result<T, Error>;
    async fn replace_one(&self, entity: &T) -> Result<T, Error>;
    async fn delete_one(&self, id: &str) -> Result<(), Error>;
}
