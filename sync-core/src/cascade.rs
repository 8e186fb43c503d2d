/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cascade delete across registered repositories. Cycle detection uses a
//! `HashSet` scoped to a single call, not a global flag, so two unrelated
//! cascades (even of the same model type) never interfere with each
//! other's traversal.

use crate::error::Error;
use crate::registry;
use std::collections::HashSet;

pub fn cascade_delete(root_type: &'static str, root_id: &str) -> Result<(), Error> {
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut stack = vec![(root_type.to_string(), root_id.to_string())];

    while let Some((model_type, id)) = stack.pop() {
        if !visited.insert((model_type.clone(), id.clone())) {
            log::warn!(
                "cascade delete: cycle detected at {}/{}, skipping re-deletion",
                model_type,
                id
            );
            continue;
        }

        let repo = registry::require(&model_type)?;
        for rel in repo.relations() {
            if !rel.cascade_delete {
                continue;
            }
            let Some(child_repo) = registry::lookup(rel.child_type) else {
                log::warn!(
                    "cascade delete: no repository registered for `{}`, its rows under {}/{} were left in place",
                    rel.child_type, model_type, id
                );
                continue;
            };
            for child_id in child_repo.find_children_ids(rel.foreign_key_field, &id)? {
                stack.push((rel.child_type.to_string(), child_id));
            }
        }
        repo.delete_local_cascaded(&id)?;
    }
    Ok(())
}
