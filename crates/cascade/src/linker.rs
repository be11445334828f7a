//! Cross-dimension sibling maps.
//!
//! Every member of a group carries a `{dimension: slug}` map of its
//! siblings of the same sub-type, itself included. Maps are recomputed
//! from the group's current members, so running a sync twice is harmless.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::guard::TimeoutGuard;
use crate::job::JobRecord;
use crate::store::{ContentRecord, ContentStore, StoreError};

/// The sibling map `record` should carry, given its group's members.
pub fn sibling_map(record: &ContentRecord, members: &[ContentRecord]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for member in members.iter().filter(|m| m.sub_type == record.sub_type) {
        map.entry(member.dimension.to_string())
            .or_insert_with(|| member.slug.clone());
    }
    map
}

/// Rewrites the sibling map of every member of a group whose map is out of
/// date. Returns how many records changed.
pub fn sync_group(store: &dyn ContentStore, grouping_key: &str) -> Result<usize, StoreError> {
    let members = store.group_members(grouping_key)?;
    let mut changed = 0;
    for member in &members {
        let map = sibling_map(member, &members);
        if map != member.translations {
            store.set_sibling_map(&member.id, &map)?;
            changed += 1;
        }
    }
    Ok(changed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Complete { groups: usize, updated: usize },
    /// Ran out of budget; `job.link_cursor` names the last finished group.
    Interrupted { cursor: Option<String> },
}

/// The one-time linking pass at job completion.
///
/// Walks the job's groups in sorted order and records a cursor after each
/// one, so an interrupted pass picks up after the last finished group.
/// `linked_at` is set only once every group is done.
pub struct LinkingPass {
    store: Arc<dyn ContentStore>,
}

impl LinkingPass {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    pub fn run(
        &self,
        job: &mut JobRecord,
        guard: &TimeoutGuard,
    ) -> Result<LinkOutcome, StoreError> {
        let keys = self.store.grouping_keys(&job.spec.source_scope())?;
        let mut groups = 0;
        let mut updated = 0;

        for key in keys {
            if let Some(cursor) = &job.link_cursor {
                if key.as_str() <= cursor.as_str() {
                    continue;
                }
            }
            if guard.exceeded() {
                log::info!(
                    "Job {}: linking interrupted after group {:?}",
                    job.id,
                    job.link_cursor
                );
                return Ok(LinkOutcome::Interrupted {
                    cursor: job.link_cursor.clone(),
                });
            }
            updated += sync_group(self.store.as_ref(), &key)?;
            groups += 1;
            job.link_cursor = Some(key);
        }

        job.linked_at = Some(guard.now());
        log::info!(
            "Job {}: linked {} group(s), {} record(s) updated",
            job.id,
            groups,
            updated
        );
        Ok(LinkOutcome::Complete { groups, updated })
    }
}
