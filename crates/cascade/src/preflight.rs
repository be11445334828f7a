//! Structural prerequisite check, run before any external call is spent on
//! a batch.
//!
//! A unit whose job names a `link_sub_type` must link back to the sibling
//! of its linked source in the unit's own dimension. If that sibling does
//! not exist yet the unit is blocked: no amount of retrying can fix it.

use crate::job::JobSpec;
use crate::store::{ContentRecord, ContentStore, StoreError};
use crate::unit::{Dimension, UnitKey};

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyUnit {
    pub source: ContentRecord,
    /// The resolved sibling the produced unit links back to.
    pub link_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockedUnit {
    pub source: ContentRecord,
    /// What has to exist before the unit can be written.
    pub missing: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preflight {
    pub ready: Vec<ReadyUnit>,
    pub blocked: Vec<BlockedUnit>,
}

impl Preflight {
    /// True when there were candidates and none of them can proceed.
    pub fn all_blocked(&self) -> bool {
        self.ready.is_empty() && !self.blocked.is_empty()
    }

    /// Distinct missing prerequisites, in candidate order.
    pub fn missing_prerequisites(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for b in &self.blocked {
            if !out.contains(&b.missing) {
                out.push(b.missing.clone());
            }
        }
        out
    }

    /// Splits `candidates` into ready and blocked units for `dimension`.
    pub fn check(
        store: &dyn ContentStore,
        spec: &JobSpec,
        dimension: &Dimension,
        candidates: Vec<ContentRecord>,
    ) -> Result<Self, StoreError> {
        let Some(link_sub_type) = spec.link_sub_type.as_deref() else {
            return Ok(Self {
                ready: candidates
                    .into_iter()
                    .map(|source| ReadyUnit {
                        source,
                        link_id: None,
                    })
                    .collect(),
                blocked: Vec::new(),
            });
        };

        let mut result = Self::default();
        for source in candidates {
            let Some(linked_id) = source.link_id.clone() else {
                result.ready.push(ReadyUnit {
                    source,
                    link_id: None,
                });
                continue;
            };

            let missing = match store.get(&linked_id)? {
                None => format!("{}/{}/{}", linked_id, spec.source_dimension, link_sub_type),
                Some(linked) => {
                    match store.find_sibling(linked.group_key(), dimension, Some(link_sub_type))? {
                        Some(sibling) => {
                            result.ready.push(ReadyUnit {
                                source,
                                link_id: Some(sibling.id),
                            });
                            continue;
                        }
                        None => UnitKey::new(linked.id.clone(), dimension.clone(), link_sub_type)
                            .to_string(),
                    }
                }
            };
            result.blocked.push(BlockedUnit { source, missing });
        }
        Ok(result)
    }
}
