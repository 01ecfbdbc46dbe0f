//! Turning a table binding into a materialization plan: the base snapshot
//! plus the ordered delta chain, with collapsed-snapshot short-circuiting
//! and index-based pruning.

use stratadb_lib::{filter_objects, ObjectId, Quals};

use crate::error::{MetaError, Result};
use crate::meta::{MetaStore, ObjectFormat, TableRef};

/// An ordered recipe for reconstructing a table: apply `objects` front to
/// back, snapshot first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializationPlan {
    /// The base snapshot (a real SNAP or a collapsed one).
    pub snap: ObjectId,
    /// The unfiltered delta chain above `snap`, oldest first.
    pub diffs: Vec<ObjectId>,
    /// What the reader actually consumes: `[snap] + diffs`, minus any
    /// objects pruned by qualifiers.
    pub objects: Vec<ObjectId>,
    /// Whether qualifier pruning strictly shrank the plan. Filtered plans
    /// reconstruct only the predicate's slice of the table and never count
    /// toward promotion.
    pub filtered: bool,
}

impl MaterializationPlan {
    /// The newest delta: the chain head the table is bound to.
    pub fn head_diff(&self) -> Option<&ObjectId> {
        self.diffs.last()
    }
}

/// Compute the plan for `table`.
///
/// Walks the parent chain head-to-root, short-circuiting at the first delta
/// that has a collapsed snapshot cached for it.
pub fn resolve_table(
    meta: &MetaStore,
    table: &TableRef,
    quals: Option<&Quals>,
) -> Result<MaterializationPlan> {
    let head = meta
        .get_object(&table.object_id)
        .ok_or(MetaError::UnknownObject(table.object_id))?;

    let (snap, diffs) = if head.format == ObjectFormat::Snap {
        (head.object_id, Vec::new())
    } else if let Some((snap_id, _)) = meta.get_snap_cache_for(&head.object_id) {
        (snap_id, Vec::new())
    } else {
        walk_chain(meta, &head.object_id)?
    };

    log::debug!(
        "resolved {}@{} table {} to snap {snap} + {} diff(s)",
        table.key.schema_name(),
        table.key.image_hash,
        table.key.table_name,
        diffs.len(),
    );

    let full: Vec<ObjectId> = std::iter::once(snap).chain(diffs.iter().copied()).collect();
    let (objects, filtered) = match quals {
        Some(quals) if !quals.is_empty() => {
            let metas = meta.get_object_meta(&full);
            let candidates = full.iter().map(|id| {
                (
                    *id,
                    metas.iter().find(|m| m.object_id == *id).map(|m| &m.index),
                )
            });
            let kept = filter_objects(candidates, &table.schema, quals);
            let filtered = kept != full;
            (kept, filtered)
        }
        _ => (full, false),
    };

    Ok(MaterializationPlan {
        snap,
        diffs,
        objects,
        filtered,
    })
}

/// Follow parents from `head` down to the root snapshot, returning
/// `(snap, diffs oldest-first)`. A cached collapsed snapshot anywhere along
/// the chain replaces everything at and below it.
fn walk_chain(meta: &MetaStore, head: &ObjectId) -> Result<(ObjectId, Vec<ObjectId>)> {
    let path = meta.get_all_required_objects(head)?;
    // `path` is newest-first; diffs collected above a short-circuit point
    // are therefore also newest-first.
    let mut above = Vec::new();
    for object_id in &path {
        if let Some((snap_id, _)) = meta.get_snap_cache_for(object_id) {
            above.reverse();
            return Ok((snap_id, above));
        }
        above.push(*object_id);
    }
    let snap = above.pop().ok_or(MetaError::UnknownObject(*head))?;
    above.reverse();
    Ok((snap, above))
}
