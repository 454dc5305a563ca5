// validate.rs -- capacity and consistency checks
//
// Nothing here is fatal. Each problem is one `Finding`; the caller decides
// whether any of them should stop a write.

use std::fmt;

use crate::bspfile::{
    child_leaf, ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, Plane, SurfEdge, TexInfo,
    Vertex, CONTENTS_MIN, MAX_MAP_HULLS,
};
use crate::document::Document;
use crate::lump::LumpId;
use crate::mathlib::Vec3;
use crate::vis;

#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    /// A table holds more entries (or bytes) than the profile allows.
    OverCapacity {
        lump: &'static str,
        count: usize,
        max: usize,
    },
    /// `table[index].field` points at `target`, past the end of a table of
    /// `len` entries.
    Dangling {
        table: &'static str,
        index: usize,
        field: &'static str,
        target: i64,
        len: usize,
    },
    /// A clip-node child below the lowest content code.
    BadContents {
        clipnode: usize,
        contents: i32,
    },
    /// A leaf's visibility row is missing or unreadable.
    VisRow { leaf: usize, reason: String },
    /// The world model claims more visible leaves than the leaf table has.
    VisLeafCount { world: usize, leaves: usize },
    WorldspawnCount(usize),
    InvertedBounds {
        table: &'static str,
        index: usize,
    },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::OverCapacity { lump, count, max } => {
                write!(f, "{lump}: {count} exceeds the limit of {max}")
            }
            Finding::Dangling { table, index, field, target, len } => {
                write!(f, "{table}[{index}].{field} = {target}, but there are only {len}")
            }
            Finding::BadContents { clipnode, contents } => {
                write!(f, "clipnodes[{clipnode}] has unknown contents {contents}")
            }
            Finding::VisRow { leaf, reason } => write!(f, "leaves[{leaf}] visibility: {reason}"),
            Finding::VisLeafCount { world, leaves } => write!(
                f,
                "world model has {world} visible leaves, leaf table has {leaves}"
            ),
            Finding::WorldspawnCount(n) => write!(f, "{n} worldspawn entities, expected 1"),
            Finding::InvertedBounds { table, index } => {
                write!(f, "{table}[{index}] has mins above maxs")
            }
        }
    }
}

/// Tables over the profile's limits. Record lumps count records, blob
/// lumps count bytes, the texture lump counts textures.
pub fn check_limits(doc: &Document) -> Vec<Finding> {
    let limits = &doc.profile().limits;
    let mut findings = Vec::new();
    for id in LumpId::ALL {
        let count = match id {
            LumpId::Textures => doc.textures().len(),
            _ if id.record_size().is_some() => doc.lumps().count(id),
            _ => doc.lumps().len(id),
        };
        let max = limits.max_for(id);
        if count > max {
            findings.push(Finding::OverCapacity {
                lump: id.name(),
                count,
                max,
            });
        }
    }
    findings
}

/// Collects dangling-reference findings for one table.
struct RefCheck<'a> {
    table: &'static str,
    findings: &'a mut Vec<Finding>,
}

impl RefCheck<'_> {
    fn index(&mut self, index: usize, field: &'static str, target: i64, len: usize) {
        if target < 0 || target as usize >= len {
            self.findings.push(Finding::Dangling {
                table: self.table,
                index,
                field,
                target,
                len,
            });
        }
    }

    /// A (first, count) range must end inside the table.
    fn range(&mut self, index: usize, field: &'static str, first: u32, count: u32, len: usize) {
        let end = first as u64 + count as u64;
        if count > 0 && end > len as u64 {
            self.findings.push(Finding::Dangling {
                table: self.table,
                index,
                field,
                target: end as i64 - 1,
                len,
            });
        }
    }

    fn node_child(&mut self, index: usize, field: &'static str, child: i32, nodes: usize, leaves: usize) {
        match child_leaf(child) {
            Some(leaf) => self.index(index, field, leaf as i64, leaves),
            None => self.index(index, field, child as i64, nodes),
        }
    }
}

fn check_bounds(findings: &mut Vec<Finding>, table: &'static str, index: usize, mins: &Vec3, maxs: &Vec3) {
    if (0..3).any(|i| mins[i] > maxs[i]) {
        findings.push(Finding::InvertedBounds { table, index });
    }
}

fn check_references(doc: &Document, findings: &mut Vec<Finding>) {
    let planes = doc.count::<Plane>();
    let nodes = doc.count::<Node>();
    let clipnodes = doc.count::<ClipNode>();
    let leaves = doc.count::<Leaf>();
    let faces = doc.count::<Face>();
    let marksurfaces = doc.count::<MarkSurface>();
    let surfedges = doc.count::<SurfEdge>();
    let edges = doc.count::<Edge>();
    let vertices = doc.count::<Vertex>();
    let texinfos = doc.count::<TexInfo>();
    let textures = doc.textures().len();

    let mut c = RefCheck { table: "nodes", findings };
    for (i, n) in doc.table::<Node>().iter().enumerate() {
        c.index(i, "plane", n.plane as i64, planes);
        c.node_child(i, "children[0]", n.children[0], nodes, leaves);
        c.node_child(i, "children[1]", n.children[1], nodes, leaves);
        c.range(i, "first_face", n.first_face, n.num_faces, faces);
    }

    c.table = "clipnodes";
    let mut bad_contents = Vec::new();
    for (i, n) in doc.table::<ClipNode>().iter().enumerate() {
        c.index(i, "plane", n.plane as i64, planes);
        for (field, child) in [("children[0]", n.children[0]), ("children[1]", n.children[1])] {
            if child >= 0 {
                c.index(i, field, child as i64, clipnodes);
            } else if child < CONTENTS_MIN {
                bad_contents.push(Finding::BadContents { clipnode: i, contents: child });
            }
        }
    }
    c.findings.extend(bad_contents);

    c.table = "leaves";
    for (i, l) in doc.table::<Leaf>().iter().enumerate() {
        c.range(i, "first_mark_surface", l.first_mark_surface, l.num_mark_surfaces, marksurfaces);
    }

    c.table = "marksurfaces";
    for (i, m) in doc.table::<MarkSurface>().iter().enumerate() {
        c.index(i, "face", m.face as i64, faces);
    }

    c.table = "faces";
    for (i, f) in doc.table::<Face>().iter().enumerate() {
        c.index(i, "plane", f.plane as i64, planes);
        c.index(i, "texinfo", f.texinfo as i64, texinfos);
        c.range(i, "first_edge", f.first_edge, f.num_edges, surfedges);
    }

    c.table = "surfedges";
    for (i, s) in doc.table::<SurfEdge>().iter().enumerate() {
        c.index(i, "edge", s.edge_index() as i64, edges);
    }

    c.table = "edges";
    for (i, e) in doc.table::<Edge>().iter().enumerate() {
        c.index(i, "v[0]", e.v[0] as i64, vertices);
        c.index(i, "v[1]", e.v[1] as i64, vertices);
    }

    c.table = "texinfo";
    for (i, t) in doc.table::<TexInfo>().iter().enumerate() {
        c.index(i, "miptex", t.miptex as i64, textures);
    }

    c.table = "models";
    for (i, m) in doc.table::<Model>().iter().enumerate() {
        c.node_child(i, "headnodes[0]", m.headnodes[0], nodes, leaves);
        for hull in 1..MAX_MAP_HULLS {
            if m.headnodes[hull] >= 0 {
                c.index(i, "headnodes", m.headnodes[hull] as i64, clipnodes);
            }
        }
        c.range(i, "first_face", m.first_face, m.num_faces, faces);
    }
}

fn check_visibility(doc: &Document, findings: &mut Vec<Finding>) {
    let data = doc.lumps().get(LumpId::Visibility);
    let leaf_count = doc.vis_leaf_count();
    let mut row = vec![0u8; vis::row_size(leaf_count)];
    for (i, leaf) in doc.table::<Leaf>().iter().enumerate().skip(1) {
        if leaf.vis_offset < 0 {
            continue;
        }
        if let Err(e) = vis::decompress_row(data, leaf.vis_offset as usize, leaf_count, &mut row) {
            findings.push(Finding::VisRow {
                leaf: i,
                reason: e.to_string(),
            });
        }
    }
    if let Some(world) = doc.record::<Model>(0) {
        if world.vis_leafs > 0 && world.vis_leafs as usize > leaf_count {
            findings.push(Finding::VisLeafCount {
                world: world.vis_leafs as usize,
                leaves: leaf_count,
            });
        }
    }
}

/// Structural problems: dangling references, unreadable visibility, the
/// wrong number of worldspawn entities, inverted bounds.
pub fn validate(doc: &Document) -> Vec<Finding> {
    let mut findings = Vec::new();
    check_references(doc, &mut findings);
    check_visibility(doc, &mut findings);

    let worldspawns = doc.entities().iter().filter(|e| e.is_worldspawn()).count();
    if worldspawns != 1 {
        findings.push(Finding::WorldspawnCount(worldspawns));
    }

    for (i, m) in doc.table::<Model>().iter().enumerate() {
        check_bounds(&mut findings, "models", i, &m.mins, &m.maxs);
    }
    for (i, n) in doc.table::<Node>().iter().enumerate() {
        check_bounds(&mut findings, "nodes", i, &n.mins, &n.maxs);
    }
    for (i, l) in doc.table::<Leaf>().iter().enumerate() {
        check_bounds(&mut findings, "leaves", i, &l.mins, &l.maxs);
    }

    for finding in &findings {
        tracing::debug!("{finding}");
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::normalize::SubFormat;
    use crate::profile::EngineProfile;
    use crate::usage::tests::two_model_doc;

    #[test]
    fn empty_document_is_clean() {
        let doc = Document::new_empty(SubFormat::HalfLife);
        assert_eq!(check_limits(&doc), vec![]);
        assert_eq!(validate(&doc), vec![]);
    }

    #[test]
    fn dangling_texinfo_in_fixture() {
        // the fixture's texinfo names miptex 0 but the directory is empty
        let doc = two_model_doc();
        let findings = validate(&doc);
        assert_eq!(findings.len(), 1, "{findings:?}");
        assert_eq!(findings[0].to_string(), "texinfo[0].miptex = 0, but there are only 0");
    }

    #[test]
    fn broken_references_are_reported() {
        let mut doc = two_model_doc();
        let mut edges = doc.records::<Edge>();
        edges[2].v[1] = 99;
        doc.set_records(&edges);
        let mut clip = doc.records::<ClipNode>();
        clip[1].children[0] = -40;
        doc.set_records(&clip);

        let findings = validate(&doc);
        assert!(findings.contains(&Finding::Dangling {
            table: "edges",
            index: 2,
            field: "v[1]",
            target: 99,
            len: 7,
        }));
        assert!(findings.contains(&Finding::BadContents { clipnode: 1, contents: -40 }));
    }

    #[test]
    fn worldspawn_count_and_bounds() {
        let mut doc = two_model_doc();
        let mut ents = doc.entities();
        ents.push(Entity::with_classname("worldspawn"));
        doc.set_entities(&ents);
        let mut m = doc.model(1).unwrap();
        m.mins[2] = 100.0;
        doc.set_record(1, &m);

        let findings = validate(&doc);
        assert!(findings.contains(&Finding::WorldspawnCount(2)));
        assert!(findings.contains(&Finding::InvertedBounds { table: "models", index: 1 }));
    }

    #[test]
    fn unreadable_vis_row() {
        let mut doc = two_model_doc();
        let mut leaves = doc.records::<Leaf>();
        leaves[1].vis_offset = 50;
        doc.set_records(&leaves);
        let findings = validate(&doc);
        assert!(findings.iter().any(|f| matches!(f, Finding::VisRow { leaf: 1, .. })));
    }

    #[test]
    fn limits_follow_the_profile() {
        let mut doc = two_model_doc();
        let mut profile = EngineProfile::half_life();
        profile.limits.max_vertices = 4;
        doc.set_profile(profile);
        assert_eq!(
            check_limits(&doc),
            vec![Finding::OverCapacity { lump: "vertices", count: 7, max: 4 }]
        );
    }
}
