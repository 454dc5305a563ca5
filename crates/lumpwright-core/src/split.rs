// split.rs -- give a model private copies of structures it shares with others
//
// Compilers reuse planes (and sometimes whole clip-node chains) across
// models. Before a model is edited in place, every entry it shares gets
// duplicated and the model is rewired onto the duplicates.

use crate::bspfile::{
    ClipNode, Edge, Face, Leaf, MarkSurface, Node, Plane, Record, SurfEdge, TexInfo, Vertex,
};
use crate::document::Document;
use crate::error::EditError;
use crate::remap::{apply_rooted, RemapTable, StructRemap};
use crate::usage::{mark_model, mark_models, StructTable, UsageSet};
use crate::vis;

/// Usage of `model_index` and of every other model.
fn usage_pair(doc: &Document, model_index: usize) -> Result<(UsageSet, UsageSet), EditError> {
    let mut mine = UsageSet::new(doc);
    mark_model(doc, model_index, &mut mine, true)?;
    let others = mark_models(doc, |i| i != model_index, true);
    Ok((mine, others))
}

/// True if the model shares planes or clip nodes with any other model.
pub fn uses_shared_structures(doc: &Document, model_index: usize) -> Result<bool, EditError> {
    let (mine, others) = usage_pair(doc, model_index)?;
    Ok(mine.intersects(&others, StructTable::Planes)
        || mine.intersects(&others, StructTable::ClipNodes))
}

/// Entries the model would need private copies of before it can be edited
/// in place. Range tables are taken whole once anything in them is shared,
/// so the copied ranges stay contiguous. Leaf 0, edge 0 and textures are
/// never copied.
pub fn shared_structures(doc: &Document, model_index: usize) -> Result<UsageSet, EditError> {
    let (mine, others) = usage_pair(doc, model_index)?;
    let mut shared = mine.intersection(&others);
    shared.unmark(StructTable::Leaves, 0);
    shared.unmark(StructTable::Edges, 0);
    for t in [
        StructTable::Faces,
        StructTable::MarkSurfaces,
        StructTable::SurfEdges,
    ] {
        if shared.count(t) > 0 {
            for (i, &m) in mine.get(t).iter().enumerate() {
                if m {
                    shared.mark(t, i);
                }
            }
        }
    }
    for i in 0..shared.get(StructTable::Textures).len() {
        shared.unmark(StructTable::Textures, i);
    }
    Ok(shared)
}

/// Append a copy of every marked `T`, recording old -> copy in `table`.
fn duplicate<T: Record>(doc: &mut Document, marks: &[bool], table: &mut RemapTable) -> usize {
    let copies: Vec<(usize, T)> = {
        let records = doc.table::<T>();
        marks
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .filter_map(|(i, _)| records.get(i).map(|r| (i, r)))
            .collect()
    };
    let records: Vec<T> = copies.iter().map(|&(_, r)| r).collect();
    let first = doc.push_records(&records);
    for (k, &(old, _)) in copies.iter().enumerate() {
        table.set(old, first + k);
    }
    table.set_new_len(first + copies.len());
    copies.len()
}

/// Append copies of every entry marked in `set`, in ascending order per
/// table, and return the old -> copy mapping with the number of copies.
/// Copied leaves get visibility rows of their own.
pub fn duplicate_structures(doc: &mut Document, set: &UsageSet) -> (StructRemap, usize) {
    let mut remap = StructRemap::identity(doc);
    let leaf_sources: Vec<usize> = set
        .get(StructTable::Leaves)
        .iter()
        .enumerate()
        .filter(|(i, &m)| m && *i > 0)
        .map(|(i, _)| i - 1)
        .collect();
    let old_vis_leaves = doc.vis_leaf_count();
    let rows = (!leaf_sources.is_empty()).then(|| vis::decompress_all(doc));

    let mut copied = 0;
    macro_rules! dup {
        ($ty:ty, $table:expr) => {
            copied += duplicate::<$ty>(doc, set.get($table), remap.table_mut($table));
        };
    }
    dup!(Plane, StructTable::Planes);
    dup!(TexInfo, StructTable::TexInfos);
    dup!(Face, StructTable::Faces);
    dup!(Node, StructTable::Nodes);
    dup!(ClipNode, StructTable::ClipNodes);
    dup!(MarkSurface, StructTable::MarkSurfaces);
    dup!(SurfEdge, StructTable::SurfEdges);
    dup!(Edge, StructTable::Edges);
    dup!(Vertex, StructTable::Vertices);

    let mut leaf_marks = set.get(StructTable::Leaves).to_vec();
    if let Some(m) = leaf_marks.first_mut() {
        *m = false;
    }
    copied += duplicate::<Leaf>(doc, &leaf_marks, remap.table_mut(StructTable::Leaves));

    if let Some(mut rows) = rows {
        rows.duplicate_leaves(&leaf_sources);
        debug_assert_eq!(rows.leaf_count(), old_vis_leaves + leaf_sources.len());
        vis::recompress_all(doc, &rows);
    }
    (remap, copied)
}

/// Duplicate everything `model_index` shares and move the model onto the
/// copies. Other models keep their original entries. Returns the number of
/// entries copied.
pub fn split(doc: &mut Document, model_index: usize) -> Result<usize, EditError> {
    let shared = shared_structures(doc, model_index)?;
    if shared.is_empty() {
        return Ok(0);
    }
    let (remap, copied) = duplicate_structures(doc, &shared);
    apply_rooted(doc, model_index, &remap)?;
    tracing::info!(model = model_index, copied, "split shared structures");
    Ok(copied)
}
