use lumpwright_core::bspfile::{
    leaf_child, ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, Plane, SurfEdge, TexInfo,
    Vertex, CONTENTS_EMPTY, CONTENTS_SOLID, LIGHTSTYLE_NONE,
};
use lumpwright_core::edit::{delete_hull, move_model};
use lumpwright_core::entity::Entity;
use lumpwright_core::hull::{build_box_hull, hull_point_contents};
use lumpwright_core::split::{split, uses_shared_structures};
use lumpwright_core::usage::StructTable;
use lumpwright_core::{collect, Document, LumpId, LumpMask, SubFormat};

/// One lit 32x32 floor quad in a single empty leaf, with a 3x3 lightmap.
fn lit_quad_doc(sub_format: SubFormat, lighting: Vec<u8>) -> Document {
    let mut doc = Document::new_empty(sub_format);
    doc.set_records(&[Plane { normal: [0.0, 0.0, 1.0], dist: 0.0, plane_type: 2 }]);
    doc.set_records(&[
        Vertex { point: [0.0, 0.0, 0.0] },
        Vertex { point: [32.0, 0.0, 0.0] },
        Vertex { point: [32.0, 32.0, 0.0] },
        Vertex { point: [0.0, 32.0, 0.0] },
    ]);
    doc.set_records(&[
        Edge { v: [0, 0] },
        Edge { v: [0, 1] },
        Edge { v: [1, 2] },
        Edge { v: [2, 3] },
        Edge { v: [3, 0] },
    ]);
    doc.set_records(&(1..=4).map(|edge| SurfEdge { edge }).collect::<Vec<_>>());
    doc.set_records(&[TexInfo {
        vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
        miptex: 0,
        flags: 0,
    }]);
    doc.set_records(&[Face {
        plane: 0,
        first_edge: 0,
        num_edges: 4,
        texinfo: 0,
        styles: [0, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE],
        light_offset: 0,
        ..Face::default()
    }]);
    doc.set_records(&[MarkSurface { face: 0 }]);
    doc.set_records(&[
        Leaf::default(),
        Leaf {
            contents: CONTENTS_EMPTY,
            maxs: [32.0, 32.0, 64.0],
            num_mark_surfaces: 1,
            ..Leaf::default()
        },
    ]);
    doc.set_records(&[Node {
        plane: 0,
        children: [leaf_child(1), leaf_child(0)],
        maxs: [32.0, 32.0, 64.0],
        num_faces: 1,
        ..Node::default()
    }]);
    doc.set_records(&[Model {
        maxs: [32.0, 32.0, 64.0],
        headnodes: [0, CONTENTS_EMPTY, CONTENTS_EMPTY, CONTENTS_EMPTY],
        num_faces: 1,
        ..Model::default()
    }]);
    doc.lumps_mut().replace(LumpId::Lighting, lighting).unwrap();
    doc
}

fn assert_same_lumps(a: &Document, b: &Document) {
    for id in LumpId::ALL {
        assert_eq!(a.lumps().get(id), b.lumps().get(id), "lump {}", id.name());
    }
}

#[test]
fn box_hull_on_fresh_document() {
    let mut doc = Document::new_empty(SubFormat::HalfLife);
    let head = build_box_hull(&mut doc, &[-16.0, -16.0, -18.0], &[16.0, 16.0, 18.0], 1).unwrap();
    assert!(head >= 0);
    assert_eq!(doc.count::<Plane>(), 6);
    assert_eq!(doc.count::<ClipNode>(), 6);
    assert_eq!(hull_point_contents(&doc, head, &[0.0, 0.0, 0.0]), CONTENTS_SOLID);
    for axis in 0..3 {
        for sign in [1.0, -1.0] {
            let mut point = [0.0; 3];
            point[axis] = 1000.0 * sign;
            assert_eq!(
                hull_point_contents(&doc, head, &point),
                CONTENTS_EMPTY,
                "{point:?} should be outside the box"
            );
        }
    }
}

#[test]
fn deleted_hull_chain_is_collected() {
    let mut doc = Document::new_empty(SubFormat::HalfLife);
    let head1 = build_box_hull(&mut doc, &[-64.0; 3], &[64.0; 3], 1).unwrap();

    // hull 2 gets an identical copy of hull 1's chain
    let chain: Vec<ClipNode> = doc.records::<ClipNode>();
    let shift = chain.len() as i32;
    let copy: Vec<ClipNode> = chain
        .iter()
        .map(|c| ClipNode {
            plane: c.plane,
            children: c.children.map(|ch| if ch >= 0 { ch + shift } else { ch }),
        })
        .collect();
    let head2 = doc.push_records(&copy) as i32;
    let mut world = doc.model(0).unwrap();
    world.headnodes[1] = head1;
    world.headnodes[2] = head2;
    doc.set_record(0, &world);

    let planes = doc.count::<Plane>();
    delete_hull(&mut doc, 2, Some(0), None).unwrap();
    assert_eq!(doc.model(0).unwrap().headnodes[2], CONTENTS_EMPTY);
    assert_eq!(doc.count::<ClipNode>(), 12, "no duplication on delete");
    assert_eq!(doc.count::<Plane>(), planes);

    let removed = collect(&mut doc, LumpMask::all());
    assert_eq!(removed.table(StructTable::ClipNodes), 6);
    assert_eq!(removed.table(StructTable::Planes), 0);
    assert_eq!(doc.count::<ClipNode>(), 6);
    let head = doc.model(0).unwrap().headnodes[1];
    assert_eq!(hull_point_contents(&doc, head, &[0.0; 3]), CONTENTS_SOLID);
}

#[test]
fn mono_lighting_round_trips_through_a_file() {
    let lighting: Vec<u8> = (0..9u8).flat_map(|k| [k * 20; 3]).collect();
    let doc = lit_quad_doc(SubFormat::Quake, lighting);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mono.bsp");
    let written = doc.write(&path).unwrap();
    assert_eq!(&written[..4], &29i32.to_le_bytes());

    let back = Document::load(&path).unwrap();
    assert_eq!(back.format().sub_format, SubFormat::Quake);
    assert_same_lumps(&doc, &back);

    let again = dir.path().join("again.bsp");
    assert_eq!(back.write(&again).unwrap(), written);
}

#[test]
fn narrow_rgb_round_trips_through_a_file() {
    let lighting: Vec<u8> = (0..27u8).collect();
    let doc = lit_quad_doc(SubFormat::HalfLife, lighting);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.bsp");
    let written = doc.write(&path).unwrap();
    let back = Document::load(&path).unwrap();
    assert_eq!(back.format().sub_format, SubFormat::HalfLife);
    assert_same_lumps(&doc, &back);
    assert_eq!(back.to_bytes(), written);
}

/// The quad world plus brush model 1 sharing the world's hull 1 box.
fn shared_hull_doc() -> Document {
    let mut doc = lit_quad_doc(SubFormat::HalfLife, (0..27u8).collect());
    let head = build_box_hull(&mut doc, &[0.0; 3], &[32.0, 32.0, 64.0], 1).unwrap();
    let mut world = doc.model(0).unwrap();
    world.headnodes[1] = head;
    doc.set_record(0, &world);
    doc.push_record(Model {
        maxs: [32.0, 32.0, 64.0],
        headnodes: [leaf_child(0), head, CONTENTS_EMPTY, CONTENTS_EMPTY],
        ..Model::default()
    });
    let mut ents = doc.entities();
    let mut wall = Entity::with_classname("func_wall");
    wall.set_brush_model(1);
    ents.push(wall);
    doc.set_entities(&ents);
    doc
}

#[test]
fn split_then_move_keeps_the_world_in_place() {
    let mut doc = shared_hull_doc();
    assert!(uses_shared_structures(&doc, 1).unwrap());
    let world_clip = doc.records::<ClipNode>();
    let world_planes = doc.records::<Plane>();

    split(&mut doc, 1).unwrap();
    assert!(!uses_shared_structures(&doc, 1).unwrap());
    assert_eq!(doc.model(0).unwrap().headnodes[1], 0);
    assert_eq!(&doc.records::<ClipNode>()[..world_clip.len()], &world_clip[..]);

    move_model(&mut doc, &[64.0, 0.0, 0.0], 1, false, false).unwrap();
    assert_eq!(&doc.records::<Plane>()[..world_planes.len()], &world_planes[..]);
    let head = doc.model(1).unwrap().headnodes[1];
    assert_eq!(hull_point_contents(&doc, head, &[80.0, 16.0, 32.0]), CONTENTS_SOLID);
    assert_eq!(hull_point_contents(&doc, 0, &[80.0, 16.0, 32.0]), CONTENTS_EMPTY);
}

#[test]
fn collect_twice_removes_nothing_more() {
    let mut doc = shared_hull_doc();
    split(&mut doc, 1).unwrap();
    // orphan the world's hull so there is something to collect
    delete_hull(&mut doc, 1, Some(0), None).unwrap();

    let first = collect(&mut doc, LumpMask::all());
    assert_eq!(first.table(StructTable::ClipNodes), 6);
    let bytes = doc.to_bytes();

    let second = collect(&mut doc, LumpMask::all());
    assert!(second.is_empty(), "{second}");
    assert_eq!(doc.to_bytes(), bytes);
}
