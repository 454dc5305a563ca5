// hull.rs -- build clip-node hulls and classify points against trees
//
// A hull is the world as seen by a box of a fixed size: solids are grown by
// the box extents so a point test against the hull answers "does the box
// centred here touch anything". Clip-node children are a clip-node index
// or a content code; child 0 is the front of the plane.

use crate::bspfile::{
    child_leaf, ClipNode, Leaf, Node, Plane, CONTENTS_EMPTY, CONTENTS_SOLID, MAX_MAP_HULLS,
};
use crate::document::Document;
use crate::error::EditError;
use crate::mathlib::{
    box_max_along, box_min_along, dot_product, plane_type_for_normal, vector_subtract, Vec3,
    PLANE_Z,
};

fn check_hull(hull: usize) -> Result<(), EditError> {
    if hull == 0 || hull >= MAX_MAP_HULLS {
        Err(EditError::BadHull(hull))
    } else {
        Ok(())
    }
}

/// Box extents of `hull` from the document's profile.
fn hull_extents(doc: &Document, hull: usize) -> (Vec3, Vec3) {
    let sizes = &doc.profile().hulls;
    (sizes.mins[hull], sizes.maxs[hull])
}

// ============================================================
// Box hulls
// ============================================================

/// Append a six-node clip chain enclosing [mins, maxs] grown by the hull
/// extents. Each axis gets a "max" node (front empty, back continues) and
/// a "min" node (front continues, back empty); the last inside branch is
/// solid. Returns the head clip-node index.
pub fn build_box_hull(
    doc: &mut Document,
    mins: &Vec3,
    maxs: &Vec3,
    hull: usize,
) -> Result<i32, EditError> {
    check_hull(hull)?;
    let (hmins, hmaxs) = hull_extents(doc, hull);
    let emins = vector_subtract(mins, &hmaxs);
    let emaxs = vector_subtract(maxs, &hmins);

    let first_plane = doc.count::<Plane>();
    let head = doc.count::<ClipNode>();

    let mut planes = Vec::with_capacity(6);
    let mut nodes = Vec::with_capacity(6);
    for i in 0..6 {
        let axis = i >> 1;
        let mut normal = [0.0; 3];
        normal[axis] = 1.0;
        let is_max = i & 1 == 0;
        planes.push(Plane {
            normal,
            dist: if is_max { emaxs[axis] } else { emins[axis] },
            plane_type: axis as i32,
        });

        let next = if i == 5 {
            CONTENTS_SOLID
        } else {
            (head + i + 1) as i32
        };
        let children = if is_max {
            [CONTENTS_EMPTY, next]
        } else {
            [next, CONTENTS_EMPTY]
        };
        nodes.push(ClipNode {
            plane: (first_plane + i) as i32,
            children,
        });
    }
    doc.push_records(&planes);
    doc.push_records(&nodes);

    tracing::debug!(hull, head, ?emins, ?emaxs, "built box hull");
    Ok(head as i32)
}

// ============================================================
// Hulls from the render tree
// ============================================================

/// Which render child holds the solid: the other side of an empty leaf,
/// otherwise the back.
fn solid_side(doc: &Document, node: &Node) -> usize {
    let is_empty = |child: i32| {
        child_leaf(child)
            .and_then(|l| doc.record::<Leaf>(l))
            .is_some_and(|l| l.contents == CONTENTS_EMPTY)
    };
    if is_empty(node.children[1]) && !is_empty(node.children[0]) {
        0
    } else {
        1
    }
}

/// Where a finished subtree gets written.
#[derive(Clone, Copy)]
enum Slot {
    Root,
    Child(usize, usize),
}

/// Grow the solids of a render subtree into a clip tree for `hull`.
/// Axial splits are skipped and the walk follows the solid side; every
/// other split becomes a clip node whose plane is pushed outward by the
/// hull extents on the solid side. Exact for convex solids only. Nodes are
/// appended in pre-order. Returns the new head (a clip-node index or a
/// content code).
pub fn regenerate_from_render_tree(
    doc: &mut Document,
    render_head: i32,
    hull: usize,
) -> Result<i32, EditError> {
    check_hull(hull)?;
    let (hmins, hmaxs) = hull_extents(doc, hull);
    let node_count = doc.count::<Node>();
    let mut visited = vec![false; node_count];

    let mut planes = Vec::new();
    let mut clipnodes: Vec<ClipNode> = Vec::new();
    let first_plane = doc.count::<Plane>();
    let first_clip = doc.count::<ClipNode>();
    let mut root = CONTENTS_EMPTY;

    let mut stack = vec![(render_head, Slot::Root)];
    while let Some((child, slot)) = stack.pop() {
        let result = if let Some(leaf) = child_leaf(child) {
            if leaf == 0 {
                CONTENTS_SOLID
            } else {
                doc.record::<Leaf>(leaf).map_or(CONTENTS_SOLID, |l| l.contents)
            }
        } else {
            let index = child as usize;
            let Some(node) = doc.record::<Node>(index) else {
                tracing::warn!(node = index, "render node past end of table");
                continue;
            };
            if std::mem::replace(&mut visited[index], true) {
                tracing::warn!(node = index, "render tree loops back on itself, branch dropped");
                CONTENTS_EMPTY
            } else {
                let Some(plane) = doc.record::<Plane>(node.plane as usize) else {
                    tracing::warn!(node = index, plane = node.plane, "plane past end of table");
                    continue;
                };
                let solid = solid_side(doc, &node);
                if plane.plane_type <= PLANE_Z {
                    stack.push((node.children[solid], slot));
                    continue;
                }

                let dist = if solid == 1 {
                    plane.dist - box_min_along(&plane.normal, &hmins, &hmaxs)
                } else {
                    plane.dist - box_max_along(&plane.normal, &hmins, &hmaxs)
                };
                planes.push(Plane {
                    normal: plane.normal,
                    dist,
                    plane_type: plane_type_for_normal(&plane.normal),
                });
                let k = clipnodes.len();
                clipnodes.push(ClipNode {
                    plane: (first_plane + planes.len() - 1) as i32,
                    children: [CONTENTS_EMPTY, CONTENTS_EMPTY],
                });
                stack.push((node.children[1], Slot::Child(k, 1)));
                stack.push((node.children[0], Slot::Child(k, 0)));
                (first_clip + k) as i32
            }
        };
        match slot {
            Slot::Root => root = result,
            Slot::Child(k, side) => clipnodes[k].children[side] = result,
        }
    }

    doc.push_records(&planes);
    doc.push_records(&clipnodes);
    tracing::debug!(hull, clipnodes = clipnodes.len(), "regenerated hull from render tree");
    Ok(root)
}

/// Rebuild hull `hull` of a model: a box hull around the model bounds
/// whose solid branch is refined by the render-tree walk. Sets the model's
/// head for that hull and returns it.
pub fn regenerate(doc: &mut Document, model_index: usize, hull: usize) -> Result<i32, EditError> {
    check_hull(hull)?;
    let mut model = doc.model(model_index)?;
    let head = build_box_hull(doc, &model.mins, &model.maxs, hull)?;

    let inner = regenerate_from_render_tree(doc, model.headnodes[0], hull)?;
    // the last box node's front branch is the solid one
    let last = head as usize + 5;
    if let Some(mut node) = doc.record::<ClipNode>(last) {
        node.children[0] = inner;
        doc.set_record(last, &node);
    }

    model.headnodes[hull] = head;
    doc.set_record(model_index, &model);
    tracing::info!(model = model_index, hull, head, "regenerated hull");
    Ok(head)
}

// ============================================================
// Point classification
// ============================================================

fn plane_diff(plane: &Plane, p: &Vec3) -> f32 {
    if (0..=PLANE_Z).contains(&plane.plane_type) {
        p[plane.plane_type as usize] - plane.dist
    } else {
        dot_product(&plane.normal, p) - plane.dist
    }
}

/// Content code at `point` in the clip tree starting at `head`.
pub fn hull_point_contents(doc: &Document, head: i32, point: &Vec3) -> i32 {
    let clipnodes = doc.table::<ClipNode>();
    let planes = doc.table::<Plane>();
    let mut num = head;
    let mut steps = 0;
    while num >= 0 {
        steps += 1;
        let Some(node) = clipnodes.get(num as usize) else {
            tracing::warn!(clipnode = num, "clip node past end of table");
            return CONTENTS_SOLID;
        };
        if steps > clipnodes.len() {
            tracing::warn!(head, "clip tree loops back on itself");
            return CONTENTS_EMPTY;
        }
        let Some(plane) = planes.get(node.plane as usize) else {
            return CONTENTS_SOLID;
        };
        num = if plane_diff(&plane, point) < 0.0 {
            node.children[1]
        } else {
            node.children[0]
        };
    }
    num
}

/// Leaf of the render tree starting at `head` that contains `point`.
/// A broken tree yields leaf 0.
pub fn render_leaf_for_point(doc: &Document, head: i32, point: &Vec3) -> usize {
    let nodes = doc.table::<Node>();
    let planes = doc.table::<Plane>();
    let mut num = head;
    let mut steps = 0;
    while num >= 0 {
        steps += 1;
        let Some(node) = nodes.get(num as usize) else {
            return 0;
        };
        if steps > nodes.len() {
            tracing::warn!(head, "render tree loops back on itself");
            return 0;
        }
        let Some(plane) = planes.get(node.plane as usize) else {
            return 0;
        };
        num = if plane_diff(&plane, point) < 0.0 {
            node.children[1]
        } else {
            node.children[0]
        };
    }
    child_leaf(num).unwrap_or(0)
}
