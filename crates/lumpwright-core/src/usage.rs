// usage.rs -- which table entries a set of models reaches
//
// Every walk is an explicit worklist. The usage bits double as the visited
// set, so a tree that points back into itself ends the walk instead of
// looping, and stack depth never depends on the input.

use crate::bspfile::{
    child_leaf, ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, Plane, SurfEdge,
    TexInfo, Vertex, MAX_MAP_HULLS,
};
use crate::document::{Document, Table};
use crate::error::EditError;
use crate::lump::LumpId;
use std::ops::Range;

/// Tables a model can reference, directly or transitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StructTable {
    Planes = 0,
    TexInfos,
    Faces,
    Nodes,
    ClipNodes,
    Leaves,
    MarkSurfaces,
    SurfEdges,
    Edges,
    Vertices,
    Textures,
}

pub const STRUCT_TABLES: usize = 11;

impl StructTable {
    pub const ALL: [StructTable; STRUCT_TABLES] = [
        StructTable::Planes,
        StructTable::TexInfos,
        StructTable::Faces,
        StructTable::Nodes,
        StructTable::ClipNodes,
        StructTable::Leaves,
        StructTable::MarkSurfaces,
        StructTable::SurfEdges,
        StructTable::Edges,
        StructTable::Vertices,
        StructTable::Textures,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn lump(self) -> LumpId {
        match self {
            StructTable::Planes => LumpId::Planes,
            StructTable::TexInfos => LumpId::TexInfo,
            StructTable::Faces => LumpId::Faces,
            StructTable::Nodes => LumpId::Nodes,
            StructTable::ClipNodes => LumpId::ClipNodes,
            StructTable::Leaves => LumpId::Leaves,
            StructTable::MarkSurfaces => LumpId::MarkSurfaces,
            StructTable::SurfEdges => LumpId::SurfEdges,
            StructTable::Edges => LumpId::Edges,
            StructTable::Vertices => LumpId::Vertices,
            StructTable::Textures => LumpId::Textures,
        }
    }

    pub fn name(self) -> &'static str {
        self.lump().name()
    }

    /// Entries addressed as (first, count) ranges.
    pub fn is_range_table(self) -> bool {
        matches!(
            self,
            StructTable::Faces | StructTable::MarkSurfaces | StructTable::SurfEdges
        )
    }

    /// Current number of entries in `doc`.
    pub fn len(self, doc: &Document) -> usize {
        match self {
            StructTable::Textures => doc.textures().len(),
            other => doc.lumps().count(other.lump()),
        }
    }
}

/// One marker per entry of every referenceable table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSet {
    marks: [Vec<bool>; STRUCT_TABLES],
}

impl UsageSet {
    /// All-clear set sized to `doc`'s tables.
    pub fn new(doc: &Document) -> Self {
        Self {
            marks: StructTable::ALL.map(|t| vec![false; t.len(doc)]),
        }
    }

    pub fn get(&self, table: StructTable) -> &[bool] {
        &self.marks[table.index()]
    }

    #[inline]
    pub fn is_marked(&self, table: StructTable, index: usize) -> bool {
        self.marks[table.index()].get(index).copied().unwrap_or(false)
    }

    /// Mark an entry. Returns true when it was newly marked, false when it
    /// was already marked or out of range.
    #[inline]
    pub fn mark(&mut self, table: StructTable, index: usize) -> bool {
        match self.marks[table.index()].get_mut(index) {
            Some(m) if !*m => {
                *m = true;
                true
            }
            Some(_) => false,
            None => {
                tracing::warn!(table = table.name(), index, "reference past end of table");
                false
            }
        }
    }

    pub fn unmark(&mut self, table: StructTable, index: usize) {
        if let Some(m) = self.marks[table.index()].get_mut(index) {
            *m = false;
        }
    }

    pub fn union(&mut self, other: &UsageSet) {
        for (mine, theirs) in self.marks.iter_mut().zip(&other.marks) {
            for (a, &b) in mine.iter_mut().zip(theirs) {
                *a |= b;
            }
        }
    }

    /// Entries marked in both sets.
    pub fn intersection(&self, other: &UsageSet) -> UsageSet {
        let mut out = self.clone();
        for (mine, theirs) in out.marks.iter_mut().zip(&other.marks) {
            for (i, a) in mine.iter_mut().enumerate() {
                *a &= theirs.get(i).copied().unwrap_or(false);
            }
        }
        out
    }

    /// True if any entry of `table` is marked in both sets.
    pub fn intersects(&self, other: &UsageSet, table: StructTable) -> bool {
        self.get(table)
            .iter()
            .zip(other.get(table))
            .any(|(&a, &b)| a && b)
    }

    pub fn count(&self, table: StructTable) -> usize {
        self.get(table).iter().filter(|&&m| m).count()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.iter().all(|m| !m.contains(&true))
    }
}

/// `first..first + count` cut to a table of `len` entries. A range that runs
/// past the end is logged once, not per index.
pub(crate) fn bounded_range(table: StructTable, first: u32, count: u32, len: usize) -> Range<usize> {
    let start = first as usize;
    let end = start.saturating_add(count as usize);
    if count > 0 && end > len {
        tracing::warn!(table = table.name(), first, count, len, "range runs past end of table");
    }
    start.min(len)..end.min(len)
}

/// Snapshot of every table `mark_model` reads, taken once per call.
struct Graph<'a> {
    planes: usize,
    nodes: Table<'a, Node>,
    clipnodes: Table<'a, ClipNode>,
    leaves: Table<'a, Leaf>,
    faces: Table<'a, Face>,
    marksurfaces: Table<'a, MarkSurface>,
    surfedges: Table<'a, SurfEdge>,
    edges: Table<'a, Edge>,
    vertices: usize,
    texinfos: Table<'a, TexInfo>,
}

impl<'a> Graph<'a> {
    fn new(doc: &'a Document) -> Self {
        Self {
            planes: doc.count::<Plane>(),
            nodes: doc.table(),
            clipnodes: doc.table(),
            leaves: doc.table(),
            faces: doc.table(),
            marksurfaces: doc.table(),
            surfedges: doc.table(),
            edges: doc.table(),
            vertices: doc.count::<Vertex>(),
            texinfos: doc.table(),
        }
    }

    fn mark_plane(&self, usage: &mut UsageSet, plane: usize) {
        if plane < self.planes {
            usage.mark(StructTable::Planes, plane);
        } else {
            tracing::warn!(plane, planes = self.planes, "plane reference past end of table");
        }
    }

    fn mark_face(&self, usage: &mut UsageSet, face_index: usize) {
        if !usage.mark(StructTable::Faces, face_index) {
            return;
        }
        let Some(face) = self.faces.get(face_index) else {
            return;
        };
        self.mark_plane(usage, face.plane as usize);

        if usage.mark(StructTable::TexInfos, face.texinfo as usize) {
            if let Some(ti) = self.texinfos.get(face.texinfo as usize) {
                // textures may legitimately be absent from the directory
                if (ti.miptex as usize) < usage.get(StructTable::Textures).len() {
                    usage.mark(StructTable::Textures, ti.miptex as usize);
                }
            }
        }

        let surfedges = bounded_range(StructTable::SurfEdges, face.first_edge, face.num_edges, self.surfedges.len());
        for se_index in surfedges {
            usage.mark(StructTable::SurfEdges, se_index);
            let Some(se) = self.surfedges.get(se_index) else {
                continue;
            };
            let edge_index = se.edge_index();
            if usage.mark(StructTable::Edges, edge_index) {
                if let Some(edge) = self.edges.get(edge_index) {
                    for v in edge.v {
                        if (v as usize) < self.vertices {
                            usage.mark(StructTable::Vertices, v as usize);
                        } else {
                            tracing::warn!(edge = edge_index, vertex = v, "vertex reference past end of table");
                        }
                    }
                }
            }
        }
    }

    fn mark_leaf(&self, usage: &mut UsageSet, leaf_index: usize, include_leaves: bool) {
        if !usage.mark(StructTable::Leaves, leaf_index) || !include_leaves {
            return;
        }
        let Some(leaf) = self.leaves.get(leaf_index) else {
            return;
        };
        let marksurfaces = bounded_range(
            StructTable::MarkSurfaces,
            leaf.first_mark_surface,
            leaf.num_mark_surfaces,
            self.marksurfaces.len(),
        );
        for ms_index in marksurfaces {
            usage.mark(StructTable::MarkSurfaces, ms_index);
            if let Some(ms) = self.marksurfaces.get(ms_index) {
                self.mark_face(usage, ms.face as usize);
            }
        }
    }

    fn mark_render_tree(&self, usage: &mut UsageSet, head: i32, include_leaves: bool) {
        let mut stack = vec![head];
        while let Some(child) = stack.pop() {
            if let Some(leaf) = child_leaf(child) {
                self.mark_leaf(usage, leaf, include_leaves);
                continue;
            }
            let index = child as usize;
            if !usage.mark(StructTable::Nodes, index) {
                continue;
            }
            let Some(node) = self.nodes.get(index) else {
                continue;
            };
            self.mark_plane(usage, node.plane as usize);
            for f in bounded_range(StructTable::Faces, node.first_face, node.num_faces, self.faces.len()) {
                self.mark_face(usage, f);
            }
            stack.push(node.children[1]);
            stack.push(node.children[0]);
        }
    }

    fn mark_clip_tree(&self, usage: &mut UsageSet, head: i32) {
        let mut stack = vec![head];
        while let Some(index) = stack.pop() {
            if index < 0 {
                continue;
            }
            let index = index as usize;
            if !usage.mark(StructTable::ClipNodes, index) {
                continue;
            }
            let Some(node) = self.clipnodes.get(index) else {
                continue;
            };
            if node.plane >= 0 {
                self.mark_plane(usage, node.plane as usize);
            }
            stack.push(node.children[1]);
            stack.push(node.children[0]);
        }
    }
}

/// Mark everything model `model_index` reaches: its face range, its render
/// tree (with leaf mark-surfaces unless `include_leaves` is false) and its
/// three clip-node trees.
pub fn mark_model(
    doc: &Document,
    model_index: usize,
    usage: &mut UsageSet,
    include_leaves: bool,
) -> Result<(), EditError> {
    let model = doc.model(model_index)?;
    mark_model_record(doc, &model, usage, include_leaves);
    Ok(())
}

pub(crate) fn mark_model_record(
    doc: &Document,
    model: &Model,
    usage: &mut UsageSet,
    include_leaves: bool,
) {
    let graph = Graph::new(doc);
    for f in bounded_range(StructTable::Faces, model.first_face, model.num_faces, graph.faces.len()) {
        graph.mark_face(usage, f);
    }
    graph.mark_render_tree(usage, model.headnodes[0], include_leaves);
    for hull in 1..MAX_MAP_HULLS {
        graph.mark_clip_tree(usage, model.headnodes[hull]);
    }
}

/// Usage of every model for which `filter` returns true.
pub fn mark_models(
    doc: &Document,
    mut filter: impl FnMut(usize) -> bool,
    include_leaves: bool,
) -> UsageSet {
    let mut usage = UsageSet::new(doc);
    for (i, model) in doc.table::<Model>().iter().enumerate() {
        if filter(i) {
            mark_model_record(doc, &model, &mut usage, include_leaves);
        }
    }
    usage
}
