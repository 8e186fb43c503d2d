/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Merge-on-refresh: reconciling a batch of remote rows against local
//! state without clobbering changes that haven't synced yet.

use crate::model::Model;
use std::collections::HashSet;

/// Drops remote rows whose id has a pending (not-yet-synced) local
/// mutation -- the local copy is the more recent truth until its queue
/// entry clears, so a bulk refresh must not overwrite it.
pub fn filter_pending<T: Model>(remote: Vec<T>, pending_ids: &HashSet<String>) -> Vec<T> {
    remote
        .into_iter()
        .filter(|r| !pending_ids.contains(r.id()))
        .collect()
}

/// Resolves a single-row conflict between a local and remote copy of the
/// same entity using their update timestamps. A model that doesn't track
/// one (`updated_at_millis` returns `None`) always defers to the remote
/// copy, since there's no local signal to prefer it over the server.
pub fn merge_one<T: Model>(local: Option<T>, remote: T) -> T {
    match local {
        None => remote,
        Some(local) => match (local.updated_at_millis(), remote.updated_at_millis()) {
            (Some(l), Some(r)) if l > r => local,
            _ => remote,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Stamped {
        id: String,
        updated_at: i64,
    }

    impl Model for Stamped {
        fn model_type() -> &'static str {
            "stamped"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn with_id(&self, new_id: &str) -> Self {
            Stamped {
                id: new_id.into(),
                updated_at: self.updated_at,
            }
        }
        fn to_json(&self) -> Result<serde_json::Value, Error> {
            Ok(json!({"id": self.id, "updated_at": self.updated_at}))
        }
        fn from_json(v: serde_json::Value) -> Result<Self, Error> {
            Ok(Stamped {
                id: v["id"].as_str().unwrap().to_string(),
                updated_at: v["updated_at"].as_i64().unwrap(),
            })
        }
        fn uses_server_generated_id() -> bool {
            false
        }
        fn updated_at_millis(&self) -> Option<i64> {
            Some(self.updated_at)
        }
    }

    #[test]
    fn filter_pending_drops_locally_dirty_rows() {
        let remote = vec![
            Stamped { id: "1".into(), updated_at: 1 },
            Stamped { id: "2".into(), updated_at: 1 },
        ];
        let pending: HashSet<String> = ["1".to_string()].into_iter().collect();
        let kept = filter_pending(remote, &pending);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2");
    }

    #[test]
    fn merge_one_prefers_newer_local_over_older_remote() {
        let local = Stamped { id: "1".into(), updated_at: 10 };
        let remote = Stamped { id: "1".into(), updated_at: 5 };
        let merged = merge_one(Some(local), remote);
        assert_eq!(merged.updated_at, 10);
    }

    #[test]
    fn merge_one_prefers_remote_when_newer_or_equal() {
        let local = Stamped { id: "1".into(), updated_at: 5 };
        let remote = Stamped { id: "1".into(), updated_at: 10 };
        let merged = merge_one(Some(local), remote);
        assert_eq!(merged.updated_at, 10);
    }
}
