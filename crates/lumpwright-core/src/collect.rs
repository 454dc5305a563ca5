// collect.rs -- drop unreachable models, structures, lightmaps and textures
//
// Reachability starts at the model table: model 0 plus every model an
// entity names as "*N". Everything those models reach survives; a table not
// named in the mask keeps all of its entries, and what those entries point
// at survives with them.

use std::fmt;

use crate::bspfile::{
    child_leaf, ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, Plane, Record, SurfEdge,
    TexInfo, Vertex,
};
use crate::document::Document;
use crate::entity::remap_brush_models;
use crate::lightmap::{FaceGeometry, RGB_SAMPLE_BYTES};
use crate::lump::{LumpId, LumpMask};
use crate::remap::{apply_global, RemapTable, StructRemap};
use crate::usage::{bounded_range, mark_models, StructTable, UsageSet};
use crate::vis;

/// Entries removed by one `collect` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedCounts {
    pub models: usize,
    pub tables: [usize; crate::usage::STRUCT_TABLES],
    pub lighting_bytes: usize,
    pub visibility_bytes: usize,
}

impl RemovedCounts {
    pub fn table(&self, t: StructTable) -> usize {
        self.tables[t.index()]
    }

    /// Entries removed across the model and structure tables.
    pub fn total(&self) -> usize {
        self.models + self.tables.iter().sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.lighting_bytes == 0 && self.visibility_bytes == 0
    }
}

impl fmt::Display for RemovedCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "removed {} models", self.models)?;
        for t in StructTable::ALL {
            let n = self.table(t);
            if n > 0 {
                write!(f, ", {} {}", n, t.name())?;
            }
        }
        if self.lighting_bytes > 0 {
            write!(f, ", {} lighting bytes", self.lighting_bytes)?;
        }
        if self.visibility_bytes > 0 {
            write!(f, ", {} visibility bytes", self.visibility_bytes)?;
        }
        Ok(())
    }
}

// ============================================================
// Models
// ============================================================

/// Remove every model with `remove[i]` set. Later models shift down and
/// entity references follow; references to removed models become the
/// error model. Model 0 is never removed.
pub(crate) fn remove_models(doc: &mut Document, remove: &[bool]) -> usize {
    let models = doc.records::<Model>();
    let keep: Vec<bool> = (0..models.len())
        .map(|i| i == 0 || !remove.get(i).copied().unwrap_or(false))
        .collect();
    let map = RemapTable::compact(&keep);
    let removed = map.removed();

    let kept: Vec<Model> = models
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(m, _)| *m)
        .collect();

    let mut entities = doc.entities();
    let count = models.len();
    let changed = remap_brush_models(&mut entities, |old| {
        if old < count {
            map.get(old)
        } else {
            None
        }
    });
    if changed > 0 {
        doc.set_entities(&entities);
    }
    if removed > 0 {
        doc.set_records(&kept);
    }
    removed
}

/// Delete models no entity references. Returns how many went.
pub fn delete_unused_models(doc: &mut Document) -> usize {
    let count = doc.model_count();
    let mut live = vec![false; count];
    if let Some(world) = live.first_mut() {
        *world = true;
    }
    for ent in doc.entities() {
        if let Some(m) = ent.brush_model() {
            if let Some(slot) = live.get_mut(m) {
                *slot = true;
            }
        }
    }
    let remove: Vec<bool> = live.iter().map(|&l| !l).collect();
    let removed = remove_models(doc, &remove);
    if removed > 0 {
        tracing::info!(removed, "deleted unreferenced models");
    }
    removed
}

// ============================================================
// Keep sets
// ============================================================

/// Entries that survive: everything reachable from the models, every entry
/// of a table outside `mask`, and whatever those extra entries reference.
/// Leaf 0 and edge 0 always survive.
fn keep_set(doc: &Document, mask: LumpMask) -> UsageSet {
    let mut keep = mark_models(doc, |_| true, true);
    for t in StructTable::ALL {
        if !mask.contains_lump(t.lump()) {
            for i in 0..keep.get(t).len() {
                keep.mark(t, i);
            }
        }
    }

    let mark = |keep: &mut UsageSet, t: StructTable, i: usize| {
        if i < keep.get(t).len() {
            keep.mark(t, i);
        }
    };
    mark(&mut keep, StructTable::Leaves, 0);
    mark(&mut keep, StructTable::Edges, 0);

    // dependency order: a pass only marks tables handled after it
    for (i, n) in doc.table::<Node>().iter().enumerate() {
        if keep.is_marked(StructTable::Nodes, i) {
            mark(&mut keep, StructTable::Planes, n.plane as usize);
            for c in n.children {
                match child_leaf(c) {
                    Some(l) => mark(&mut keep, StructTable::Leaves, l),
                    None => mark(&mut keep, StructTable::Nodes, c as usize),
                }
            }
            let faces = keep.get(StructTable::Faces).len();
            for f in bounded_range(StructTable::Faces, n.first_face, n.num_faces, faces) {
                mark(&mut keep, StructTable::Faces, f);
            }
        }
    }
    for (i, c) in doc.table::<ClipNode>().iter().enumerate() {
        if keep.is_marked(StructTable::ClipNodes, i) {
            if c.plane >= 0 {
                mark(&mut keep, StructTable::Planes, c.plane as usize);
            }
            for child in c.children {
                if child >= 0 {
                    mark(&mut keep, StructTable::ClipNodes, child as usize);
                }
            }
        }
    }
    for (i, l) in doc.table::<Leaf>().iter().enumerate() {
        if keep.is_marked(StructTable::Leaves, i) {
            let len = keep.get(StructTable::MarkSurfaces).len();
            for ms in bounded_range(StructTable::MarkSurfaces, l.first_mark_surface, l.num_mark_surfaces, len) {
                mark(&mut keep, StructTable::MarkSurfaces, ms);
            }
        }
    }
    for (i, ms) in doc.table::<MarkSurface>().iter().enumerate() {
        if keep.is_marked(StructTable::MarkSurfaces, i) {
            mark(&mut keep, StructTable::Faces, ms.face as usize);
        }
    }
    for (i, f) in doc.table::<Face>().iter().enumerate() {
        if keep.is_marked(StructTable::Faces, i) {
            mark(&mut keep, StructTable::Planes, f.plane as usize);
            mark(&mut keep, StructTable::TexInfos, f.texinfo as usize);
            let len = keep.get(StructTable::SurfEdges).len();
            for se in bounded_range(StructTable::SurfEdges, f.first_edge, f.num_edges, len) {
                mark(&mut keep, StructTable::SurfEdges, se);
            }
        }
    }
    for (i, se) in doc.table::<SurfEdge>().iter().enumerate() {
        if keep.is_marked(StructTable::SurfEdges, i) {
            mark(&mut keep, StructTable::Edges, se.edge_index());
        }
    }
    for (i, e) in doc.table::<Edge>().iter().enumerate() {
        if keep.is_marked(StructTable::Edges, i) {
            for v in e.v {
                mark(&mut keep, StructTable::Vertices, v as usize);
            }
        }
    }
    for (i, ti) in doc.table::<TexInfo>().iter().enumerate() {
        if keep.is_marked(StructTable::TexInfos, i) {
            mark(&mut keep, StructTable::Textures, ti.miptex as usize);
        }
    }
    keep
}

fn compact_records<T: Record>(doc: &mut Document, keep: &[bool]) {
    let kept: Vec<T> = doc
        .table::<T>()
        .iter()
        .zip(keep)
        .filter(|(_, &k)| k)
        .map(|(r, _)| r)
        .collect();
    doc.set_records(&kept);
}

// ============================================================
// Lighting
// ============================================================

/// Rebuild the lighting lump from the spans live faces use, in offset
/// order. Overlapping spans are merged so shared samples stay shared.
/// Returns bytes removed, or 0 when some face can't be sized.
fn compact_lighting(doc: &mut Document) -> usize {
    let mut faces = doc.records::<Face>();
    let texinfos = doc.records::<TexInfo>();
    let surfedges = doc.records::<SurfEdge>();
    let edges = doc.records::<Edge>();
    let vertices = doc.records::<Vertex>();
    let geometry = FaceGeometry {
        texinfos: &texinfos,
        surfedges: &surfedges,
        edges: &edges,
        vertices: &vertices,
    };
    let lighting = doc.lumps().get(LumpId::Lighting);

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (i, face) in faces.iter().enumerate() {
        if face.light_offset < 0 || face.lightmap_count() == 0 {
            continue;
        }
        let Some(samples) = geometry.sample_count(face) else {
            tracing::warn!(face = i, "can't size lightmap, lighting left as is");
            return 0;
        };
        let start = face.light_offset as usize;
        let end = (start + samples * RGB_SAMPLE_BYTES).min(lighting.len());
        if start >= lighting.len() {
            tracing::warn!(face = i, offset = start, "lightmap starts past the lighting lump");
            continue;
        }
        spans.push((start, end));
    }
    spans.sort_unstable();

    // merged (old_start, old_end, new_start)
    let mut merged: Vec<(usize, usize, usize)> = Vec::new();
    let mut out = Vec::with_capacity(lighting.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start < last.1 => {
                if end > last.1 {
                    out.extend_from_slice(&lighting[last.1..end]);
                    last.1 = end;
                }
            }
            _ => {
                merged.push((start, end, out.len()));
                out.extend_from_slice(&lighting[start..end]);
            }
        }
    }

    for face in faces.iter_mut() {
        if face.light_offset < 0 {
            continue;
        }
        if face.lightmap_count() == 0 {
            face.light_offset = -1;
            continue;
        }
        let ofs = face.light_offset as usize;
        face.light_offset = merged
            .iter()
            .find(|&&(s, e, _)| ofs >= s && ofs < e)
            .map_or(-1, |&(s, _, n)| (n + ofs - s) as i32);
    }

    let removed = lighting.len().saturating_sub(out.len());
    doc.lumps_mut().put_blob(LumpId::Lighting, out);
    doc.set_records(&faces);
    removed
}

// ============================================================
// Collect
// ============================================================

/// Remove everything unreachable from the live models, limited to the
/// tables in `mask`. Unreferenced models go first when `mask` includes
/// models. A second run over the result removes nothing.
pub fn collect(doc: &mut Document, mask: LumpMask) -> RemovedCounts {
    let progress = doc.progress();
    progress.start("collect", StructTable::ALL.len());
    let mut counts = RemovedCounts::default();

    if mask.contains(LumpMask::MODELS) {
        counts.models = delete_unused_models(doc);
    }

    let rows = (mask.intersects(LumpMask::LEAVES | LumpMask::VISIBILITY))
        .then(|| vis::decompress_all(doc));
    let old_vis_len = doc.lumps().len(LumpId::Visibility);

    let keep = keep_set(doc, mask);
    let mut remap = StructRemap::identity(doc);
    for t in StructTable::ALL {
        progress.tick();
        if !mask.contains_lump(t.lump()) {
            continue;
        }
        let marks = keep.get(t);
        let table = RemapTable::compact(marks);
        if table.is_identity() {
            continue;
        }
        match t {
            StructTable::Planes => compact_records::<Plane>(doc, marks),
            StructTable::TexInfos => compact_records::<TexInfo>(doc, marks),
            StructTable::Faces => compact_records::<Face>(doc, marks),
            StructTable::Nodes => compact_records::<Node>(doc, marks),
            StructTable::ClipNodes => compact_records::<ClipNode>(doc, marks),
            StructTable::Leaves => compact_records::<Leaf>(doc, marks),
            StructTable::MarkSurfaces => compact_records::<MarkSurface>(doc, marks),
            StructTable::SurfEdges => compact_records::<SurfEdge>(doc, marks),
            StructTable::Edges => compact_records::<Edge>(doc, marks),
            StructTable::Vertices => compact_records::<Vertex>(doc, marks),
            StructTable::Textures => {
                let mut dir = doc.textures();
                dir.retain(marks);
                doc.set_textures(&dir);
            }
        }
        counts.tables[t.index()] = table.removed();
        remap.set_table(t, table);
    }
    apply_global(doc, &remap);

    if let Some(mut rows) = rows {
        let leaves = remap.table(StructTable::Leaves);
        if leaves.removed() > 0 {
            // vis row i belongs to leaf i + 1
            let removed: Vec<bool> = (1..leaves.len()).map(|l| leaves.get(l).is_none()).collect();
            rows.remove_leaves(&removed);
        }
        vis::recompress_all(doc, &rows);
        counts.visibility_bytes = old_vis_len.saturating_sub(doc.lumps().len(LumpId::Visibility));
    }

    if mask.contains(LumpMask::LIGHTING) {
        counts.lighting_bytes = compact_lighting(doc);
    }

    progress.finish();
    tracing::info!("collect: {counts}");
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspfile::{leaf_child, CONTENTS_EMPTY, LIGHTSTYLE_NONE};
    use crate::entity::{Entity, ERROR_MODEL};
    use crate::usage::tests::two_model_doc;
    use crate::vis::VisRows;

    #[test]
    fn unused_vertex_and_edge_go() {
        let mut doc = two_model_doc();
        let counts = collect(&mut doc, LumpMask::all());
        assert_eq!(counts.models, 0);
        assert_eq!(counts.table(StructTable::Vertices), 1);
        assert_eq!(doc.count::<Vertex>(), 6);
        // edge 0 is reserved
        assert_eq!(counts.table(StructTable::Edges), 0);
        assert!(counts.to_string().contains("1 vertices"));
    }

    #[test]
    fn collect_is_idempotent() {
        let mut doc = two_model_doc();
        collect(&mut doc, LumpMask::all());
        let once = doc.to_bytes();
        let again = collect(&mut doc, LumpMask::all());
        assert!(again.is_empty(), "{again}");
        assert_eq!(doc.to_bytes(), once);
    }

    #[test]
    fn unreferenced_model_and_its_tree_go() {
        let mut doc = two_model_doc();
        let mut ents = doc.entities();
        ents.retain(|e| e.brush_model().is_none());
        doc.set_entities(&ents);

        let counts = collect(&mut doc, LumpMask::all());
        assert_eq!(counts.models, 1);
        assert_eq!(doc.model_count(), 1);
        assert_eq!(counts.table(StructTable::Nodes), 1);
        assert_eq!(counts.table(StructTable::ClipNodes), 2);
        assert_eq!(counts.table(StructTable::Faces), 1);
        assert_eq!(doc.count::<ClipNode>(), 1);
        assert_eq!(doc.model(0).unwrap().headnodes[1], 0);
        assert_eq!(doc.record::<Face>(0).unwrap().first_edge, 0);
    }

    #[test]
    fn model_references_shift_after_deletion() {
        let mut doc = two_model_doc();
        let m = doc.model(1).unwrap();
        doc.push_record(m);
        let mut ents = doc.entities();
        ents.retain(|e| e.brush_model().is_none());
        let mut e = Entity::with_classname("func_door");
        e.set_brush_model(2);
        ents.push(e);
        let mut bad = Entity::with_classname("func_wall");
        bad.set_brush_model(9);
        ents.push(bad);
        doc.set_entities(&ents);

        assert_eq!(delete_unused_models(&mut doc), 1);
        let ents = doc.entities();
        assert_eq!(ents[1].brush_model(), Some(1));
        assert_eq!(ents[2].get("model"), Some(ERROR_MODEL));
    }

    #[test]
    fn oversized_edge_count_is_bounded() {
        let mut doc = two_model_doc();
        let mut face = doc.record::<Face>(1).unwrap();
        face.num_edges = 4_000_000_000;
        doc.set_record(1, &face);

        let counts = collect(&mut doc, LumpMask::all() - LumpMask::LIGHTING);
        assert_eq!(counts.table(StructTable::SurfEdges), 0);
        assert_eq!(counts.table(StructTable::Vertices), 1);
        assert_eq!(doc.count::<SurfEdge>(), 6);
    }

    #[test]
    fn masked_tables_are_left_alone() {
        let mut doc = two_model_doc();
        let counts = collect(&mut doc, LumpMask::PLANES);
        assert_eq!(counts.total(), 0);
        assert_eq!(doc.count::<Vertex>(), 7);
    }

    #[test]
    fn removed_leaf_drops_its_vis_row() {
        let mut doc = two_model_doc();
        // leaf 3 is reachable from nothing
        doc.push_record(Leaf { contents: CONTENTS_EMPTY, ..Leaf::default() });
        let mut rows = VisRows::new(3);
        rows.set_row(0, Some(vec![0b101]));
        rows.set_row(1, Some(vec![0b010]));
        rows.set_row(2, Some(vec![0b111]));
        vis::recompress_all(&mut doc, &rows);

        let counts = collect(&mut doc, LumpMask::all());
        assert_eq!(counts.table(StructTable::Leaves), 1);
        let rows = vis::decompress_all(&doc);
        assert_eq!(rows.leaf_count(), 2);
        assert_eq!(rows.row(0).unwrap()[0], 0b01);
        assert_eq!(rows.row(1).unwrap()[0], 0b10);
        assert_eq!(doc.record::<Node>(0).unwrap().children[1], leaf_child(2));
    }

    #[test]
    fn lighting_is_packed_in_offset_order() {
        let mut doc = two_model_doc();
        // face 0 is 5x5 samples, face 1 is 6x5, one style each
        let mut faces = doc.records::<Face>();
        faces[0].styles = [0, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE];
        faces[0].light_offset = 300;
        faces[1].styles = [0, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE];
        faces[1].light_offset = 0;
        doc.set_records(&faces);
        let lighting: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        doc.lumps_mut().replace(LumpId::Lighting, lighting).unwrap();

        let counts = collect(&mut doc, LumpMask::LIGHTING);
        assert_eq!(counts.lighting_bytes, 500 - 90 - 75);
        let faces = doc.records::<Face>();
        assert_eq!(faces[1].light_offset, 0);
        assert_eq!(faces[0].light_offset, 90);
        assert_eq!(doc.lumps().get(LumpId::Lighting)[90], 300u32 as u8);
    }
}
