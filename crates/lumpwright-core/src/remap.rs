// remap.rs -- rewrite every embedded index through old -> new tables
//
// Two modes. `apply_global` rewrites every record of every table exactly
// once (compaction). `apply_rooted` rewrites only what one model reaches,
// walking from the model record with a visited set per table, so entries
// owned by other models are never touched (splitting and duplication).

use crate::bspfile::{
    child_leaf, leaf_child, ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, SurfEdge,
    TexInfo, MAX_MAP_HULLS,
};
use crate::document::Document;
use crate::error::EditError;
use crate::usage::{bounded_range, StructTable, STRUCT_TABLES};

/// Marker for an entry that no longer exists.
pub const REMOVED: u32 = u32::MAX;

/// Old -> new index mapping for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTable {
    map: Vec<u32>,
    new_len: usize,
}

impl RemapTable {
    pub fn identity(len: usize) -> Self {
        Self {
            map: (0..len as u32).collect(),
            new_len: len,
        }
    }

    /// Order-preserving compaction: kept entries are numbered in order.
    pub fn compact(keep: &[bool]) -> Self {
        let mut next = 0u32;
        let map = keep
            .iter()
            .map(|&k| {
                if k {
                    next += 1;
                    next - 1
                } else {
                    REMOVED
                }
            })
            .collect();
        Self {
            map,
            new_len: next as usize,
        }
    }

    /// Entries in the table before remapping.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in the table after remapping.
    pub fn new_len(&self) -> usize {
        self.new_len
    }

    pub fn set_new_len(&mut self, new_len: usize) {
        self.new_len = new_len;
    }

    /// New index of `old`. Indices past the table map to themselves;
    /// removed entries map to `None`.
    #[inline]
    pub fn get(&self, old: usize) -> Option<usize> {
        match self.map.get(old) {
            Some(&REMOVED) => None,
            Some(&new) => Some(new as usize),
            None => Some(old),
        }
    }

    pub fn set(&mut self, old: usize, new: usize) {
        if let Some(slot) = self.map.get_mut(old) {
            *slot = new as u32;
        }
    }

    pub fn removed(&self) -> usize {
        self.map.iter().filter(|&&m| m == REMOVED).count()
    }

    pub fn is_identity(&self) -> bool {
        self.new_len == self.map.len() && self.map.iter().enumerate().all(|(i, &m)| m as usize == i)
    }

    /// New start of a (first, count) range: the new index of the first
    /// surviving entry at or after `first`, or the end of the new table.
    pub fn range_start(&self, first: usize) -> usize {
        if first >= self.map.len() {
            return first - self.map.len() + self.new_len;
        }
        self.map[first..]
            .iter()
            .find(|&&m| m != REMOVED)
            .map_or(self.new_len, |&m| m as usize)
    }
}

/// One `RemapTable` per referenceable table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructRemap {
    tables: [RemapTable; STRUCT_TABLES],
}

impl StructRemap {
    pub fn identity(doc: &Document) -> Self {
        Self {
            tables: StructTable::ALL.map(|t| RemapTable::identity(t.len(doc))),
        }
    }

    pub fn table(&self, t: StructTable) -> &RemapTable {
        &self.tables[t.index()]
    }

    pub fn table_mut(&mut self, t: StructTable) -> &mut RemapTable {
        &mut self.tables[t.index()]
    }

    pub fn set_table(&mut self, t: StructTable, table: RemapTable) {
        self.tables[t.index()] = table;
    }
}

/// Owned copies of every table that carries references.
struct Tables {
    nodes: Vec<Node>,
    clipnodes: Vec<ClipNode>,
    leaves: Vec<Leaf>,
    faces: Vec<Face>,
    marksurfaces: Vec<MarkSurface>,
    surfedges: Vec<SurfEdge>,
    edges: Vec<Edge>,
    texinfos: Vec<TexInfo>,
    models: Vec<Model>,
}

impl Tables {
    fn load(doc: &Document) -> Self {
        Self {
            nodes: doc.records(),
            clipnodes: doc.records(),
            leaves: doc.records(),
            faces: doc.records(),
            marksurfaces: doc.records(),
            surfedges: doc.records(),
            edges: doc.records(),
            texinfos: doc.records(),
            models: doc.records(),
        }
    }

    fn store(&self, doc: &mut Document) {
        doc.set_records(&self.nodes);
        doc.set_records(&self.clipnodes);
        doc.set_records(&self.leaves);
        doc.set_records(&self.faces);
        doc.set_records(&self.marksurfaces);
        doc.set_records(&self.surfedges);
        doc.set_records(&self.edges);
        doc.set_records(&self.texinfos);
        doc.set_records(&self.models);
    }
}

/// Applies a `StructRemap` to individual fields, counting references to
/// removed entries.
struct Rewriter<'a> {
    remap: &'a StructRemap,
    dangling: usize,
}

impl<'a> Rewriter<'a> {
    fn index(&mut self, t: StructTable, old: u32) -> u32 {
        match self.remap.table(t).get(old as usize) {
            Some(new) => new as u32,
            None => {
                self.dangling += 1;
                tracing::warn!(table = t.name(), index = old, "reference to a removed entry");
                0
            }
        }
    }

    fn range_start(&self, t: StructTable, first: u32) -> u32 {
        self.remap.table(t).range_start(first as usize) as u32
    }

    fn node_child(&mut self, child: i32) -> i32 {
        match child_leaf(child) {
            Some(leaf) => leaf_child(self.index(StructTable::Leaves, leaf as u32) as usize),
            None => self.index(StructTable::Nodes, child as u32) as i32,
        }
    }

    fn clip_child(&mut self, child: i32) -> i32 {
        if child < 0 {
            child
        } else {
            self.index(StructTable::ClipNodes, child as u32) as i32
        }
    }

    fn node(&mut self, n: &mut Node) {
        n.plane = self.index(StructTable::Planes, n.plane);
        n.children = [self.node_child(n.children[0]), self.node_child(n.children[1])];
        n.first_face = self.range_start(StructTable::Faces, n.first_face);
    }

    fn clipnode(&mut self, c: &mut ClipNode) {
        if c.plane >= 0 {
            c.plane = self.index(StructTable::Planes, c.plane as u32) as i32;
        }
        c.children = [self.clip_child(c.children[0]), self.clip_child(c.children[1])];
    }

    fn leaf(&mut self, l: &mut Leaf) {
        l.first_mark_surface = self.range_start(StructTable::MarkSurfaces, l.first_mark_surface);
    }

    fn face(&mut self, f: &mut Face) {
        f.plane = self.index(StructTable::Planes, f.plane);
        f.texinfo = self.index(StructTable::TexInfos, f.texinfo);
        f.first_edge = self.range_start(StructTable::SurfEdges, f.first_edge);
    }

    fn marksurface(&mut self, m: &mut MarkSurface) {
        m.face = self.index(StructTable::Faces, m.face);
    }

    fn surfedge(&mut self, s: &mut SurfEdge) {
        let edge = self.index(StructTable::Edges, s.edge_index() as u32);
        *s = s.with_edge(edge as usize);
    }

    fn edge(&mut self, e: &mut Edge) {
        e.v = [
            self.index(StructTable::Vertices, e.v[0]),
            self.index(StructTable::Vertices, e.v[1]),
        ];
    }

    fn texinfo(&mut self, t: &mut TexInfo) {
        // texture slots past the directory stay as they are
        if let Some(new) = self.remap.table(StructTable::Textures).get(t.miptex as usize) {
            t.miptex = new as u32;
        }
    }

    fn model(&mut self, m: &mut Model) {
        m.headnodes[0] = self.node_child(m.headnodes[0]);
        for hull in 1..MAX_MAP_HULLS {
            m.headnodes[hull] = self.clip_child(m.headnodes[hull]);
        }
        m.first_face = self.range_start(StructTable::Faces, m.first_face);
    }
}

/// Rewrite every reference in the document. Returns the number of
/// references that pointed at removed entries (rewritten to 0).
pub fn apply_global(doc: &mut Document, remap: &StructRemap) -> usize {
    let progress = doc.progress();
    let mut t = Tables::load(doc);
    let total = t.nodes.len()
        + t.clipnodes.len()
        + t.leaves.len()
        + t.faces.len()
        + t.marksurfaces.len()
        + t.surfedges.len()
        + t.edges.len()
        + t.texinfos.len()
        + t.models.len();
    progress.start("remap", total);

    let mut rw = Rewriter { remap, dangling: 0 };
    t.nodes.iter_mut().for_each(|n| rw.node(n));
    progress.advance(t.nodes.len());
    t.clipnodes.iter_mut().for_each(|c| rw.clipnode(c));
    progress.advance(t.clipnodes.len());
    t.leaves.iter_mut().for_each(|l| rw.leaf(l));
    t.faces.iter_mut().for_each(|f| rw.face(f));
    t.marksurfaces.iter_mut().for_each(|m| rw.marksurface(m));
    t.surfedges.iter_mut().for_each(|s| rw.surfedge(s));
    t.edges.iter_mut().for_each(|e| rw.edge(e));
    t.texinfos.iter_mut().for_each(|ti| rw.texinfo(ti));
    t.models.iter_mut().for_each(|m| rw.model(m));

    t.store(doc);
    progress.finish();
    if rw.dangling > 0 {
        tracing::warn!(dangling = rw.dangling, "remap left dangling references");
    }
    rw.dangling
}

/// Per-table visited flags indexed by the entry being rewritten.
struct Visited {
    flags: [Vec<bool>; STRUCT_TABLES],
}

impl Visited {
    fn new(t: &Tables) -> Self {
        let mut flags: [Vec<bool>; STRUCT_TABLES] = Default::default();
        flags[StructTable::Nodes.index()] = vec![false; t.nodes.len()];
        flags[StructTable::ClipNodes.index()] = vec![false; t.clipnodes.len()];
        flags[StructTable::Leaves.index()] = vec![false; t.leaves.len()];
        flags[StructTable::Faces.index()] = vec![false; t.faces.len()];
        flags[StructTable::MarkSurfaces.index()] = vec![false; t.marksurfaces.len()];
        flags[StructTable::SurfEdges.index()] = vec![false; t.surfedges.len()];
        flags[StructTable::Edges.index()] = vec![false; t.edges.len()];
        flags[StructTable::TexInfos.index()] = vec![false; t.texinfos.len()];
        Self { flags }
    }

    /// True the first time `index` is seen; false if seen before or out of range.
    fn first_visit(&mut self, table: StructTable, index: usize) -> bool {
        match self.flags[table.index()].get_mut(index) {
            Some(v) if !*v => {
                *v = true;
                true
            }
            _ => false,
        }
    }
}

/// Rewrite only the entries reachable from model `model_index`. Every
/// reference is followed through the remap first, so the walk lands on the
/// entry that now belongs to the model (a fresh copy after a split) and
/// rewrites that one. Returns the number of dangling references.
pub fn apply_rooted(
    doc: &mut Document,
    model_index: usize,
    remap: &StructRemap,
) -> Result<usize, EditError> {
    let mut model = doc.model(model_index)?;
    let mut t = Tables::load(doc);
    let mut visited = Visited::new(&t);
    let mut rw = Rewriter { remap, dangling: 0 };

    let old_model = model;
    rw.model(&mut model);

    let mut faces: Vec<u32> =
        bounded_range(StructTable::Faces, old_model.first_face, old_model.num_faces, t.faces.len())
            .map(|f| f as u32)
            .collect();
    let mut render: Vec<i32> = vec![old_model.headnodes[0]];
    let mut clip: Vec<i32> = old_model.headnodes[1..].to_vec();

    // render tree: nodes and leaves
    while let Some(child) = render.pop() {
        if let Some(leaf_old) = child_leaf(child) {
            let leaf_new = rw.index(StructTable::Leaves, leaf_old as u32) as usize;
            // the solid sentinel belongs to every model
            if leaf_new == 0 || !visited.first_visit(StructTable::Leaves, leaf_new) {
                continue;
            }
            let leaf = &mut t.leaves[leaf_new];
            let marksurfaces = bounded_range(
                StructTable::MarkSurfaces,
                leaf.first_mark_surface,
                leaf.num_mark_surfaces,
                t.marksurfaces.len(),
            );
            rw.leaf(leaf);
            for ms_old in marksurfaces {
                let ms_new = rw.index(StructTable::MarkSurfaces, ms_old as u32) as usize;
                if !visited.first_visit(StructTable::MarkSurfaces, ms_new) {
                    continue;
                }
                let ms = &mut t.marksurfaces[ms_new];
                faces.push(ms.face);
                rw.marksurface(ms);
            }
            continue;
        }

        let node_new = rw.index(StructTable::Nodes, child as u32) as usize;
        if !visited.first_visit(StructTable::Nodes, node_new) {
            continue;
        }
        let node = &mut t.nodes[node_new];
        let old = *node;
        rw.node(node);
        let len = t.faces.len();
        faces.extend(bounded_range(StructTable::Faces, old.first_face, old.num_faces, len).map(|f| f as u32));
        render.push(old.children[1]);
        render.push(old.children[0]);
    }

    // clip trees
    while let Some(child) = clip.pop() {
        if child < 0 {
            continue;
        }
        let new = rw.index(StructTable::ClipNodes, child as u32) as usize;
        if !visited.first_visit(StructTable::ClipNodes, new) {
            continue;
        }
        let node = &mut t.clipnodes[new];
        let old = *node;
        rw.clipnode(node);
        clip.push(old.children[1]);
        clip.push(old.children[0]);
    }

    // faces and their edges
    while let Some(face_old) = faces.pop() {
        let face_new = rw.index(StructTable::Faces, face_old) as usize;
        if !visited.first_visit(StructTable::Faces, face_new) {
            continue;
        }
        let face = &mut t.faces[face_new];
        let old = *face;
        rw.face(face);

        let ti_new = rw.index(StructTable::TexInfos, old.texinfo) as usize;
        if visited.first_visit(StructTable::TexInfos, ti_new) {
            rw.texinfo(&mut t.texinfos[ti_new]);
        }

        for se_old in bounded_range(StructTable::SurfEdges, old.first_edge, old.num_edges, t.surfedges.len()) {
            let se_new = rw.index(StructTable::SurfEdges, se_old as u32) as usize;
            if !visited.first_visit(StructTable::SurfEdges, se_new) {
                continue;
            }
            let se = &mut t.surfedges[se_new];
            let edge_old = se.edge_index();
            rw.surfedge(se);

            let edge_new = rw.index(StructTable::Edges, edge_old as u32) as usize;
            if visited.first_visit(StructTable::Edges, edge_new) {
                rw.edge(&mut t.edges[edge_new]);
            }
        }
    }

    t.models[model_index] = model;
    t.store(doc);
    if rw.dangling > 0 {
        tracing::warn!(model = model_index, dangling = rw.dangling, "rooted remap left dangling references");
    }
    Ok(rw.dangling)
}
