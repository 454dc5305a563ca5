// bspfile.rs -- BSP file format structures (Quake / Half-Life / BSP2 families)
//
// Every table is held in memory in one canonical wide layout (the BSP2 record
// layout). Legacy layouts are translated by `normalize`; this module only knows
// the canonical records and the primitive little-endian readers/writers.

use crate::lump::LumpId;
use crate::mathlib::Vec3;

// ============================================================
// Header
// ============================================================

pub const BSPVERSION_QUAKE: i32 = 29;
pub const BSPVERSION_HALFLIFE: i32 = 30;

/// BSP2 magic: "BSP2" in little-endian
pub const BSP2_HEADER: i32 =
    (b'2' as i32) << 24 | (b'P' as i32) << 16 | (b'S' as i32) << 8 | b'B' as i32;
/// BSP2 with 16-bit bounds (RMQ variant): "2PSB" in little-endian
pub const BSP2RMQ_HEADER: i32 =
    (b'B' as i32) << 24 | (b'S' as i32) << 16 | (b'P' as i32) << 8 | b'2' as i32;
/// Extension header magic: "XASH" in little-endian
pub const IDEXTRAHEADER: i32 =
    (b'H' as i32) << 24 | (b'S' as i32) << 16 | (b'A' as i32) << 8 | b'X' as i32;
pub const EXTRA_VERSION: i32 = 4;

pub const HEADER_LUMPS: usize = 15;
pub const EXTRA_LUMPS: usize = 12;

/// version(4) + 15 * (offset, length)
pub const HEADER_SIZE: usize = 4 + HEADER_LUMPS * 8;
/// ident(4) + version(4) + 12 * (offset, length)
pub const EXTRA_HEADER_SIZE: usize = 8 + EXTRA_LUMPS * 8;

pub const MAX_MAP_HULLS: usize = 4;
pub const MAXLIGHTMAPS: usize = 4;
pub const NUM_AMBIENTS: usize = 4;

/// Light style slot that marks "no lightmap".
pub const LIGHTSTYLE_NONE: u8 = 255;

// ============================================================
// Contents
// ============================================================

pub const CONTENTS_EMPTY: i32 = -1;
pub const CONTENTS_SOLID: i32 = -2;
pub const CONTENTS_WATER: i32 = -3;
pub const CONTENTS_SLIME: i32 = -4;
pub const CONTENTS_LAVA: i32 = -5;
pub const CONTENTS_SKY: i32 = -6;
pub const CONTENTS_ORIGIN: i32 = -7;
pub const CONTENTS_CLIP: i32 = -8;
pub const CONTENTS_CURRENT_0: i32 = -9;
pub const CONTENTS_CURRENT_90: i32 = -10;
pub const CONTENTS_CURRENT_180: i32 = -11;
pub const CONTENTS_CURRENT_270: i32 = -12;
pub const CONTENTS_CURRENT_UP: i32 = -13;
pub const CONTENTS_CURRENT_DOWN: i32 = -14;
pub const CONTENTS_TRANSLUCENT: i32 = -15;
pub const CONTENTS_LADDER: i32 = -16;

/// Lowest content code a clip-node child may legally hold.
pub const CONTENTS_MIN: i32 = CONTENTS_LADDER;

// ============================================================
// Child encoding helpers
// ============================================================

/// Render-tree child: negative values are `!leaf_index`.
#[inline]
pub fn child_leaf(child: i32) -> Option<usize> {
    if child < 0 {
        Some(!child as usize)
    } else {
        None
    }
}

#[inline]
pub fn leaf_child(leaf: usize) -> i32 {
    !(leaf as i32)
}

// ============================================================
// Little-endian reading
// ============================================================

/// A read past the end of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrun {
    pub at: usize,
    pub wanted: usize,
    pub len: usize,
}

/// Length-checked little-endian cursor. Never panics on short input.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Overrun> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let s = &self.data[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(Overrun {
                at: self.pos,
                wanted: n,
                len: self.data.len(),
            }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Overrun> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, Overrun> {
        Ok(self.array::<1>()?[0])
    }

    pub fn i16(&mut self) -> Result<i16, Overrun> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u16(&mut self) -> Result<u16, Overrun> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, Overrun> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, Overrun> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, Overrun> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn vec3(&mut self) -> Result<Vec3, Overrun> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    /// Three 16-bit integer coordinates widened to floats.
    pub fn vec3_i16(&mut self) -> Result<Vec3, Overrun> {
        Ok([self.i16()? as f32, self.i16()? as f32, self.i16()? as f32])
    }
}

// ============================================================
// Little-endian writing
// ============================================================

#[inline]
pub fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_vec3(out: &mut Vec<u8>, v: &Vec3) {
    for c in v {
        put_f32(out, *c);
    }
}

/// Narrow bounds: mins round down, maxs round up, both clamped to i16.
pub fn put_bounds_i16(out: &mut Vec<u8>, mins: &Vec3, maxs: &Vec3) {
    for c in mins {
        put_i16(out, c.floor().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    for c in maxs {
        put_i16(out, c.ceil().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
}

pub fn bounds_fit_i16(mins: &Vec3, maxs: &Vec3) -> bool {
    let fits = |v: f32| v >= i16::MIN as f32 && v <= i16::MAX as f32;
    mins.iter().all(|c| fits(c.floor())) && maxs.iter().all(|c| fits(c.ceil()))
}

// ============================================================
// Canonical records
// ============================================================

/// A fixed-size entry of one typed lump in the canonical (wide) layout.
///
/// `decode` is only ever handed exactly `SIZE` bytes (see `Table`), so it
/// indexes its input directly.
pub trait Record: Copy + Default + std::fmt::Debug + PartialEq {
    const SIZE: usize;
    const LUMP: LumpId;

    fn decode(b: &[u8]) -> Self;
    fn encode(&self, out: &mut Vec<u8>);
}

#[inline]
fn le_i32(b: &[u8], ofs: usize) -> i32 {
    i32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
fn le_u32(b: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
fn le_f32(b: &[u8], ofs: usize) -> f32 {
    f32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
fn le_vec3(b: &[u8], ofs: usize) -> Vec3 {
    [le_f32(b, ofs), le_f32(b, ofs + 4), le_f32(b, ofs + 8)]
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: i32,
}

impl Record for Plane {
    const SIZE: usize = 20;
    const LUMP: LumpId = LumpId::Planes;

    fn decode(b: &[u8]) -> Self {
        Self {
            normal: le_vec3(b, 0),
            dist: le_f32(b, 12),
            plane_type: le_i32(b, 16),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_vec3(out, &self.normal);
        put_f32(out, self.dist);
        put_i32(out, self.plane_type);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    pub point: Vec3,
}

impl Record for Vertex {
    const SIZE: usize = 12;
    const LUMP: LumpId = LumpId::Vertices;

    fn decode(b: &[u8]) -> Self {
        Self { point: le_vec3(b, 0) }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_vec3(out, &self.point);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Node {
    pub plane: u32,
    /// non-negative = node index, negative = `!leaf_index`
    pub children: [i32; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
    pub first_face: u32,
    pub num_faces: u32,
}

impl Record for Node {
    const SIZE: usize = 44;
    const LUMP: LumpId = LumpId::Nodes;

    fn decode(b: &[u8]) -> Self {
        Self {
            plane: le_u32(b, 0),
            children: [le_i32(b, 4), le_i32(b, 8)],
            mins: le_vec3(b, 12),
            maxs: le_vec3(b, 24),
            first_face: le_u32(b, 36),
            num_faces: le_u32(b, 40),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.plane);
        put_i32(out, self.children[0]);
        put_i32(out, self.children[1]);
        put_vec3(out, &self.mins);
        put_vec3(out, &self.maxs);
        put_u32(out, self.first_face);
        put_u32(out, self.num_faces);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipNode {
    pub plane: i32,
    /// non-negative = clip-node index, negative = content code
    pub children: [i32; 2],
}

impl Record for ClipNode {
    const SIZE: usize = 12;
    const LUMP: LumpId = LumpId::ClipNodes;

    fn decode(b: &[u8]) -> Self {
        Self {
            plane: le_i32(b, 0),
            children: [le_i32(b, 4), le_i32(b, 8)],
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.plane);
        put_i32(out, self.children[0]);
        put_i32(out, self.children[1]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leaf {
    pub contents: i32,
    /// Offset into the visibility lump, or -1 for "no visibility row".
    pub vis_offset: i32,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub first_mark_surface: u32,
    pub num_mark_surfaces: u32,
    pub ambient_levels: [u8; NUM_AMBIENTS],
}

impl Default for Leaf {
    fn default() -> Self {
        Self {
            contents: CONTENTS_SOLID,
            vis_offset: -1,
            mins: [0.0; 3],
            maxs: [0.0; 3],
            first_mark_surface: 0,
            num_mark_surfaces: 0,
            ambient_levels: [0; NUM_AMBIENTS],
        }
    }
}

impl Record for Leaf {
    const SIZE: usize = 44;
    const LUMP: LumpId = LumpId::Leaves;

    fn decode(b: &[u8]) -> Self {
        Self {
            contents: le_i32(b, 0),
            vis_offset: le_i32(b, 4),
            mins: le_vec3(b, 8),
            maxs: le_vec3(b, 20),
            first_mark_surface: le_u32(b, 32),
            num_mark_surfaces: le_u32(b, 36),
            ambient_levels: [b[40], b[41], b[42], b[43]],
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.contents);
        put_i32(out, self.vis_offset);
        put_vec3(out, &self.mins);
        put_vec3(out, &self.maxs);
        put_u32(out, self.first_mark_surface);
        put_u32(out, self.num_mark_surfaces);
        out.extend_from_slice(&self.ambient_levels);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Face {
    pub plane: u32,
    pub side: u32,
    pub first_edge: u32,
    pub num_edges: u32,
    pub texinfo: u32,
    pub styles: [u8; MAXLIGHTMAPS],
    /// Byte offset into the (RGB) lighting lump, or -1.
    pub light_offset: i32,
}

impl Default for Face {
    fn default() -> Self {
        Self {
            plane: 0,
            side: 0,
            first_edge: 0,
            num_edges: 0,
            texinfo: 0,
            styles: [LIGHTSTYLE_NONE; MAXLIGHTMAPS],
            light_offset: -1,
        }
    }
}

impl Face {
    /// Number of light styles in use (each one owns a lightmap).
    pub fn lightmap_count(&self) -> usize {
        self.styles.iter().take_while(|&&s| s != LIGHTSTYLE_NONE).count()
    }
}

impl Record for Face {
    const SIZE: usize = 28;
    const LUMP: LumpId = LumpId::Faces;

    fn decode(b: &[u8]) -> Self {
        Self {
            plane: le_u32(b, 0),
            side: le_u32(b, 4),
            first_edge: le_u32(b, 8),
            num_edges: le_u32(b, 12),
            texinfo: le_u32(b, 16),
            styles: [b[20], b[21], b[22], b[23]],
            light_offset: le_i32(b, 24),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.plane);
        put_u32(out, self.side);
        put_u32(out, self.first_edge);
        put_u32(out, self.num_edges);
        put_u32(out, self.texinfo);
        out.extend_from_slice(&self.styles);
        put_i32(out, self.light_offset);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Edge {
    pub v: [u32; 2],
}

impl Record for Edge {
    const SIZE: usize = 8;
    const LUMP: LumpId = LumpId::Edges;

    fn decode(b: &[u8]) -> Self {
        Self {
            v: [le_u32(b, 0), le_u32(b, 4)],
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.v[0]);
        put_u32(out, self.v[1]);
    }
}

/// Signed edge reference: negative walks the edge from v[1] to v[0].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SurfEdge {
    pub edge: i32,
}

impl SurfEdge {
    pub fn edge_index(&self) -> usize {
        self.edge.unsigned_abs() as usize
    }

    /// Same direction, different edge.
    pub fn with_edge(&self, edge: usize) -> Self {
        let e = edge as i32;
        Self {
            edge: if self.edge < 0 { -e } else { e },
        }
    }
}

impl Record for SurfEdge {
    const SIZE: usize = 4;
    const LUMP: LumpId = LumpId::SurfEdges;

    fn decode(b: &[u8]) -> Self {
        Self { edge: le_i32(b, 0) }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_i32(out, self.edge);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkSurface {
    pub face: u32,
}

impl Record for MarkSurface {
    const SIZE: usize = 4;
    const LUMP: LumpId = LumpId::MarkSurfaces;

    fn decode(b: &[u8]) -> Self {
        Self { face: le_u32(b, 0) }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.face);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TexInfo {
    /// [s, t] basis vectors, the fourth component is the shift.
    pub vecs: [[f32; 4]; 2],
    pub miptex: u32,
    pub flags: u32,
}

impl TexInfo {
    pub fn axis(&self, i: usize) -> Vec3 {
        [self.vecs[i][0], self.vecs[i][1], self.vecs[i][2]]
    }
}

impl Record for TexInfo {
    const SIZE: usize = 40;
    const LUMP: LumpId = LumpId::TexInfo;

    fn decode(b: &[u8]) -> Self {
        let mut vecs = [[0.0; 4]; 2];
        for (i, v) in vecs.iter_mut().enumerate() {
            for (j, c) in v.iter_mut().enumerate() {
                *c = le_f32(b, (i * 4 + j) * 4);
            }
        }
        Self {
            vecs,
            miptex: le_u32(b, 32),
            flags: le_u32(b, 36),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for v in &self.vecs {
            for c in v {
                put_f32(out, *c);
            }
        }
        put_u32(out, self.miptex);
        put_u32(out, self.flags);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Model {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    /// [0] render tree head, [1..4] clip-node heads (negative = content code)
    pub headnodes: [i32; MAX_MAP_HULLS],
    pub vis_leafs: i32,
    pub first_face: u32,
    pub num_faces: u32,
}

impl Record for Model {
    const SIZE: usize = 64;
    const LUMP: LumpId = LumpId::Models;

    fn decode(b: &[u8]) -> Self {
        Self {
            mins: le_vec3(b, 0),
            maxs: le_vec3(b, 12),
            origin: le_vec3(b, 24),
            headnodes: [le_i32(b, 36), le_i32(b, 40), le_i32(b, 44), le_i32(b, 48)],
            vis_leafs: le_i32(b, 52),
            first_face: le_u32(b, 56),
            num_faces: le_u32(b, 60),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_vec3(out, &self.mins);
        put_vec3(out, &self.maxs);
        put_vec3(out, &self.origin);
        for h in &self.headnodes {
            put_i32(out, *h);
        }
        put_i32(out, self.vis_leafs);
        put_u32(out, self.first_face);
        put_u32(out, self.num_faces);
    }
}

// =============================================================================
// Tests
// =============================================================================
