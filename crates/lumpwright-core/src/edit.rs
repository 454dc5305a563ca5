// edit.rs -- model-level edits: move, duplicate, delete, hull surgery
//
// Edits that change geometry in place first make sure the target owns what
// it is about to change (see split.rs). Structures an edit orphans are left
// in place for `collect` to remove.

use crate::bspfile::{
    leaf_child, Leaf, Model, Node, Plane, TexInfo, Vertex, CONTENTS_EMPTY, MAX_MAP_HULLS,
};
use crate::collect::remove_models;
use crate::document::Document;
use crate::error::EditError;
use crate::hull::build_box_hull;
use crate::mathlib::{dot_product, vector_add, Vec3};
use crate::remap::apply_rooted;
use crate::split::{duplicate_structures, split};
use crate::usage::{mark_model, mark_models, StructTable, UsageSet};

// ============================================================
// Move
// ============================================================

/// Models owned by brush entities that carry their own "origin": their
/// geometry is origin-relative, so a whole-world move shifts the key only.
fn origin_brush_models(doc: &Document) -> Vec<bool> {
    let mut pinned = vec![false; doc.model_count()];
    for ent in doc.entities() {
        if ent.origin().is_none() {
            continue;
        }
        if let Some(m) = ent.brush_model().filter(|&m| m > 0) {
            if let Some(slot) = pinned.get_mut(m) {
                *slot = true;
            }
        }
    }
    pinned
}

fn check_bounds(
    doc: &Document,
    moving: &[bool],
    offset: &Vec3,
    limit: f32,
) -> Result<(), EditError> {
    for (i, model) in doc.table::<Model>().iter().enumerate() {
        if !moving.get(i).copied().unwrap_or(false) {
            continue;
        }
        let mins = vector_add(&model.mins, offset);
        let maxs = vector_add(&model.maxs, offset);
        if mins.iter().chain(&maxs).any(|c| c.abs() > limit) {
            return Err(EditError::OutOfBounds { model: i, limit });
        }
    }
    Ok(())
}

fn shift_bounds(mins: &mut Vec3, maxs: &mut Vec3, offset: &Vec3) {
    *mins = vector_add(mins, offset);
    *maxs = vector_add(maxs, offset);
}

/// Translate everything marked in `usage` by `offset`.
fn translate(doc: &mut Document, usage: &UsageSet, offset: &Vec3) {
    let mut vertices = doc.records::<Vertex>();
    for (v, _) in vertices
        .iter_mut()
        .zip(usage.get(StructTable::Vertices))
        .filter(|(_, &m)| m)
    {
        v.point = vector_add(&v.point, offset);
    }
    doc.set_records(&vertices);

    let mut planes = doc.records::<Plane>();
    for (p, _) in planes
        .iter_mut()
        .zip(usage.get(StructTable::Planes))
        .filter(|(_, &m)| m)
    {
        p.dist += dot_product(&p.normal, offset);
    }
    doc.set_records(&planes);

    let mut nodes = doc.records::<Node>();
    for (n, _) in nodes
        .iter_mut()
        .zip(usage.get(StructTable::Nodes))
        .filter(|(_, &m)| m)
    {
        shift_bounds(&mut n.mins, &mut n.maxs, offset);
    }
    doc.set_records(&nodes);

    let mut leaves = doc.records::<Leaf>();
    for (i, (l, _)) in leaves
        .iter_mut()
        .zip(usage.get(StructTable::Leaves))
        .enumerate()
        .filter(|(_, (_, &m))| m)
    {
        if i > 0 {
            shift_bounds(&mut l.mins, &mut l.maxs, offset);
        }
    }
    doc.set_records(&leaves);

    // keep textures glued to the moved surfaces
    let mut texinfos = doc.records::<TexInfo>();
    for (t, _) in texinfos
        .iter_mut()
        .zip(usage.get(StructTable::TexInfos))
        .filter(|(_, &m)| m)
    {
        for i in 0..2 {
            let d = dot_product(&t.axis(i), offset);
            t.vecs[i][3] -= d;
        }
    }
    doc.set_records(&texinfos);
}

/// Move model `model_index` by `offset`, or every model when `whole_world`
/// is set. Shared structures are split off first so other models stay put.
/// A whole-world move also shifts entity origins. Unless `force` is set, a
/// move that would carry a model past the profile's coordinate limit is
/// refused before anything changes.
pub fn move_model(
    doc: &mut Document,
    offset: &Vec3,
    model_index: usize,
    whole_world: bool,
    force: bool,
) -> Result<(), EditError> {
    doc.model(model_index)?;
    let count = doc.model_count();
    let pinned = if whole_world {
        origin_brush_models(doc)
    } else {
        vec![false; count]
    };
    let moving: Vec<bool> = (0..count)
        .map(|i| if whole_world { !pinned[i] } else { i == model_index })
        .collect();

    if !force {
        check_bounds(doc, &moving, offset, doc.profile().limits.max_map_coord)?;
    }

    if whole_world {
        for (i, _) in pinned.iter().enumerate().filter(|(_, &p)| p) {
            split(doc, i)?;
        }
    } else {
        split(doc, model_index)?;
    }

    let mut usage = mark_models(doc, |i| moving[i], true);
    usage.unmark(StructTable::Leaves, 0);
    translate(doc, &usage, offset);

    let mut models = doc.records::<Model>();
    for (m, _) in models.iter_mut().zip(&moving).filter(|(_, &mv)| mv) {
        shift_bounds(&mut m.mins, &mut m.maxs, offset);
    }
    doc.set_records(&models);

    if whole_world {
        let mut entities = doc.entities();
        let mut shifted = 0;
        for ent in entities.iter_mut().filter(|e| !e.is_worldspawn()) {
            if let Some(origin) = ent.origin() {
                ent.set_origin(vector_add(&origin, offset));
                shifted += 1;
            }
        }
        if shifted > 0 {
            doc.set_entities(&entities);
        }
        tracing::info!(?offset, entities = shifted, "moved world");
    } else {
        tracing::info!(model = model_index, ?offset, "moved model");
    }
    Ok(())
}

// ============================================================
// Duplicate / delete
// ============================================================

/// Append a copy of a brush model with private copies of everything it
/// uses (textures excepted). Copied leaves get copies of their visibility
/// rows. Returns the new model's index; no entity refers to it yet.
pub fn duplicate_model(doc: &mut Document, model_index: usize) -> Result<usize, EditError> {
    if model_index == 0 {
        return Err(EditError::WorldModel("duplicated"));
    }
    let model = doc.model(model_index)?;
    let mut usage = UsageSet::new(doc);
    mark_model(doc, model_index, &mut usage, true)?;
    usage.unmark(StructTable::Leaves, 0);
    usage.unmark(StructTable::Edges, 0);
    for i in 0..usage.get(StructTable::Textures).len() {
        usage.unmark(StructTable::Textures, i);
    }

    let (remap, copied) = duplicate_structures(doc, &usage);
    let new_index = doc.push_record(model);
    apply_rooted(doc, new_index, &remap)?;
    tracing::info!(model = model_index, copy = new_index, copied, "duplicated model");
    Ok(new_index)
}

/// Remove a brush model. Later models shift down one and entity references
/// follow; entities that used the deleted model get the error model. Its
/// structures stay until the next `collect`.
pub fn delete_model(doc: &mut Document, model_index: usize) -> Result<(), EditError> {
    if model_index == 0 {
        return Err(EditError::WorldModel("deleted"));
    }
    doc.model(model_index)?;
    let mut remove = vec![false; doc.model_count()];
    remove[model_index] = true;
    remove_models(doc, &remove);
    tracing::info!(model = model_index, "deleted model");
    Ok(())
}

/// Clear hull `hull` of one model, or of every model when `model_index` is
/// `None`. Hull 0 loses its render tree and faces. With `redirect`, the
/// hull takes over the head of another hull of the same kind instead of
/// becoming empty.
pub fn delete_hull(
    doc: &mut Document,
    hull: usize,
    model_index: Option<usize>,
    redirect: Option<usize>,
) -> Result<(), EditError> {
    if hull >= MAX_MAP_HULLS {
        return Err(EditError::BadHull(hull));
    }
    if let Some(r) = redirect {
        if r == hull {
            return Err(EditError::SelfRedirect(hull));
        }
        // render and clip heads index different tables
        if r >= MAX_MAP_HULLS || (r == 0) != (hull == 0) {
            return Err(EditError::BadHull(r));
        }
    }
    if let Some(m) = model_index {
        doc.model(m)?;
    }

    let mut models = doc.records::<Model>();
    for (i, m) in models.iter_mut().enumerate() {
        if model_index.is_some_and(|target| target != i) {
            continue;
        }
        match redirect {
            Some(r) => m.headnodes[hull] = m.headnodes[r],
            None if hull == 0 => {
                m.headnodes[0] = leaf_child(0);
                m.num_faces = 0;
            }
            None => m.headnodes[hull] = CONTENTS_EMPTY,
        }
    }
    doc.set_records(&models);
    tracing::info!(hull, model = ?model_index, ?redirect, "deleted hull");
    Ok(())
}

/// Replace a clip hull with a plain box around the model's bounds.
/// Returns the new head.
pub fn simplify_hull(doc: &mut Document, model_index: usize, hull: usize) -> Result<i32, EditError> {
    let mut model = doc.model(model_index)?;
    let head = build_box_hull(doc, &model.mins, &model.maxs, hull)?;
    model.headnodes[hull] = head;
    doc.set_record(model_index, &model);
    tracing::info!(model = model_index, hull, head, "simplified hull");
    Ok(head)
}
