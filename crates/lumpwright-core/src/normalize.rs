// normalize.rs -- sub-format detection and translation to/from the canonical layout
//
// Load: every legacy record is widened to the canonical record, the detected
// layout is remembered as capability flags. Save: the narrowest layout that
// can hold the current tables is chosen again, restoring the clip-node quirk
// encoding and monochrome lighting when the file had them.

use bitflags::bitflags;

use crate::bspfile::*;
use crate::error::{LoadError, LumpError};
use crate::lightmap::{FaceGeometry, RGB_SAMPLE_BYTES};
use crate::lump::{ExtraLumps, LumpId, LumpStore};
use crate::mathlib::Vec3;
use crate::profile::EngineProfile;

// ============================================================
// Sub-formats and capabilities
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubFormat {
    /// version 29, monochrome lighting
    Quake,
    /// version 30, RGB lighting
    HalfLife,
    /// "BSP2": 32-bit indices, float bounds
    Bsp2,
    /// "2PSB": 32-bit indices, 16-bit bounds
    Bsp2Rmq,
}

impl SubFormat {
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            BSPVERSION_QUAKE => Some(SubFormat::Quake),
            BSPVERSION_HALFLIFE => Some(SubFormat::HalfLife),
            BSP2_HEADER => Some(SubFormat::Bsp2),
            BSP2RMQ_HEADER => Some(SubFormat::Bsp2Rmq),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            SubFormat::Quake => BSPVERSION_QUAKE,
            SubFormat::HalfLife => BSPVERSION_HALFLIFE,
            SubFormat::Bsp2 => BSP2_HEADER,
            SubFormat::Bsp2Rmq => BSP2RMQ_HEADER,
        }
    }

    pub fn is_wide(self) -> bool {
        matches!(self, SubFormat::Bsp2 | SubFormat::Bsp2Rmq)
    }

    /// Capability flags implied by the record layout alone.
    pub fn layout_capabilities(self) -> Capabilities {
        match self {
            SubFormat::Quake | SubFormat::HalfLife => Capabilities::empty(),
            SubFormat::Bsp2Rmq => Capabilities::WIDE_INDICES,
            SubFormat::Bsp2 => Capabilities::WIDE_INDICES | Capabilities::FLOAT_BOUNDS,
        }
    }
}

bitflags! {
    /// What the file on disk looked like, derived at load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const WIDE_NODES = 1 << 0;
        const WIDE_CLIPNODES = 1 << 1;
        const WIDE_LEAVES = 1 << 2;
        const WIDE_FACES = 1 << 3;
        const WIDE_EDGES = 1 << 4;
        const WIDE_MARKSURFACES = 1 << 5;
        /// node/leaf bounds stored as floats
        const FLOAT_BOUNDS = 1 << 6;
        /// clip-node children past 32767 stored as unsigned 16-bit values
        const CLIPNODE_UNSIGNED_QUIRK = 1 << 7;
        /// one byte per lighting sample instead of RGB
        const MONO_LIGHTING = 1 << 8;
        const EXTENSION_HEADER = 1 << 9;

        const WIDE_INDICES = Self::WIDE_NODES.bits() | Self::WIDE_CLIPNODES.bits()
            | Self::WIDE_LEAVES.bits() | Self::WIDE_FACES.bits()
            | Self::WIDE_EDGES.bits() | Self::WIDE_MARKSURFACES.bits();
    }
}

/// Detected format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub sub_format: SubFormat,
    pub caps: Capabilities,
}

impl FormatInfo {
    pub fn new(sub_format: SubFormat) -> Self {
        let mut caps = sub_format.layout_capabilities();
        if sub_format == SubFormat::Quake {
            caps |= Capabilities::MONO_LIGHTING;
        }
        Self { sub_format, caps }
    }
}

// ============================================================
// Record layouts
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Narrow,
    Bsp2,
    Bsp2Rmq,
}

impl Layout {
    fn of(sub_format: SubFormat) -> Self {
        match sub_format {
            SubFormat::Quake | SubFormat::HalfLife => Layout::Narrow,
            SubFormat::Bsp2 => Layout::Bsp2,
            SubFormat::Bsp2Rmq => Layout::Bsp2Rmq,
        }
    }

    fn record_size(self, id: LumpId) -> Option<usize> {
        let narrow = self == Layout::Narrow;
        match id {
            LumpId::Nodes => Some(match self {
                Layout::Narrow => 24,
                Layout::Bsp2 => 44,
                Layout::Bsp2Rmq => 32,
            }),
            LumpId::Leaves => Some(match self {
                Layout::Narrow => 28,
                Layout::Bsp2 => 44,
                Layout::Bsp2Rmq => 32,
            }),
            LumpId::Faces => Some(if narrow { 20 } else { 28 }),
            LumpId::ClipNodes => Some(if narrow { 8 } else { 12 }),
            LumpId::Edges => Some(if narrow { 4 } else { 8 }),
            LumpId::MarkSurfaces => Some(if narrow { 2 } else { 4 }),
            other => other.record_size(),
        }
    }
}

/// Lumps whose file layout never differs from the canonical one.
const PASSTHROUGH_LUMPS: [LumpId; 9] = [
    LumpId::Entities,
    LumpId::Planes,
    LumpId::Textures,
    LumpId::Vertices,
    LumpId::Visibility,
    LumpId::TexInfo,
    LumpId::SurfEdges,
    LumpId::Models,
    LumpId::Lighting,
];

// ============================================================
// Load
// ============================================================

fn decode_records<T>(
    id: LumpId,
    raw: &[u8],
    layout: Layout,
    mut read: impl FnMut(&mut ByteReader) -> Result<T, Overrun>,
) -> Result<Vec<T>, LoadError> {
    let size = layout.record_size(id).unwrap_or(1);
    if raw.len() % size != 0 {
        return Err(LoadError::FunnyLumpSize {
            lump: id.name(),
            len: raw.len(),
            record_size: size,
        });
    }
    let mut r = ByteReader::new(raw);
    let mut out = Vec::with_capacity(raw.len() / size);
    while r.remaining() > 0 {
        out.push(read(&mut r)?);
    }
    Ok(out)
}

fn encode_canonical<T: Record>(records: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * T::SIZE);
    for r in records {
        r.encode(&mut out);
    }
    out
}

fn read_bounds(r: &mut ByteReader, layout: Layout) -> Result<(Vec3, Vec3), Overrun> {
    if layout == Layout::Bsp2 {
        Ok((r.vec3()?, r.vec3()?))
    } else {
        Ok((r.vec3_i16()?, r.vec3_i16()?))
    }
}

fn decode_nodes(raw: &[u8], layout: Layout) -> Result<Vec<Node>, LoadError> {
    decode_records(LumpId::Nodes, raw, layout, |r| {
        let plane = r.u32()?;
        let children = if layout == Layout::Narrow {
            [r.i16()? as i32, r.i16()? as i32]
        } else {
            [r.i32()?, r.i32()?]
        };
        let (mins, maxs) = read_bounds(r, layout)?;
        let (first_face, num_faces) = if layout == Layout::Narrow {
            (r.u16()? as u32, r.u16()? as u32)
        } else {
            (r.u32()?, r.u32()?)
        };
        Ok(Node {
            plane,
            children,
            mins,
            maxs,
            first_face,
            num_faces,
        })
    })
}

fn decode_leaves(raw: &[u8], layout: Layout) -> Result<Vec<Leaf>, LoadError> {
    decode_records(LumpId::Leaves, raw, layout, |r| {
        let contents = r.i32()?;
        let vis_offset = r.i32()?;
        let (mins, maxs) = read_bounds(r, layout)?;
        let (first_mark_surface, num_mark_surfaces) = if layout == Layout::Narrow {
            (r.u16()? as u32, r.u16()? as u32)
        } else {
            (r.u32()?, r.u32()?)
        };
        let mut ambient_levels = [0u8; NUM_AMBIENTS];
        ambient_levels.copy_from_slice(r.bytes(NUM_AMBIENTS)?);
        Ok(Leaf {
            contents,
            vis_offset,
            mins,
            maxs,
            first_mark_surface,
            num_mark_surfaces,
            ambient_levels,
        })
    })
}

fn decode_faces(raw: &[u8], layout: Layout) -> Result<Vec<Face>, LoadError> {
    decode_records(LumpId::Faces, raw, layout, |r| {
        let narrow = layout == Layout::Narrow;
        let plane = if narrow { r.u16()? as u32 } else { r.u32()? };
        let side = if narrow { r.u16()? as u32 } else { r.u32()? };
        let first_edge = r.u32()?;
        let num_edges = if narrow { r.u16()? as u32 } else { r.u32()? };
        let texinfo = if narrow { r.u16()? as u32 } else { r.u32()? };
        let mut styles = [0u8; MAXLIGHTMAPS];
        styles.copy_from_slice(r.bytes(MAXLIGHTMAPS)?);
        let light_offset = r.i32()?;
        Ok(Face {
            plane,
            side,
            first_edge,
            num_edges,
            texinfo,
            styles,
            light_offset,
        })
    })
}

fn decode_clipnodes(raw: &[u8], layout: Layout) -> Result<Vec<ClipNode>, LoadError> {
    decode_records(LumpId::ClipNodes, raw, layout, |r| {
        let plane = r.i32()?;
        let children = if layout == Layout::Narrow {
            [r.i16()? as i32, r.i16()? as i32]
        } else {
            [r.i32()?, r.i32()?]
        };
        Ok(ClipNode { plane, children })
    })
}

fn decode_edges(raw: &[u8], layout: Layout) -> Result<Vec<Edge>, LoadError> {
    decode_records(LumpId::Edges, raw, layout, |r| {
        let v = if layout == Layout::Narrow {
            [r.u16()? as u32, r.u16()? as u32]
        } else {
            [r.u32()?, r.u32()?]
        };
        Ok(Edge { v })
    })
}

fn decode_marksurfaces(raw: &[u8], layout: Layout) -> Result<Vec<MarkSurface>, LoadError> {
    decode_records(LumpId::MarkSurfaces, raw, layout, |r| {
        let face = if layout == Layout::Narrow {
            r.u16()? as u32
        } else {
            r.u32()?
        };
        Ok(MarkSurface { face })
    })
}

/// Some compilers write clip-node children as unsigned 16-bit values once the
/// tree grows past 32767 nodes, which wraps them into the content-code range.
/// Returns true when any child was corrected.
fn fix_unsigned_clipnode_children(clipnodes: &mut [ClipNode]) -> bool {
    if clipnodes.len() <= i16::MAX as usize {
        if clipnodes.iter().any(|c| c.children.iter().any(|&ch| ch < CONTENTS_MIN)) {
            tracing::warn!("clipnode child below the lowest content code in a small tree");
        }
        return false;
    }

    let mut fixed = false;
    for node in clipnodes.iter_mut() {
        for child in node.children.iter_mut() {
            if *child < CONTENTS_MIN {
                *child = (*child as i16 as u16) as i32;
                fixed = true;
            }
        }
    }
    fixed
}

/// Guess whether lighting samples are one byte or three by comparing the
/// gap between consecutive face lighting offsets to the faces' sample counts.
fn lighting_is_mono(
    faces: &[Face],
    geometry: &FaceGeometry,
    lighting_len: usize,
    fallback: bool,
) -> bool {
    let mut spans: Vec<(usize, usize)> = faces
        .iter()
        .filter(|f| f.light_offset >= 0 && f.lightmap_count() > 0)
        .filter_map(|f| Some((f.light_offset as usize, geometry.sample_count(f)?)))
        .filter(|&(_, n)| n > 0)
        .collect();
    spans.sort_unstable();
    spans.dedup_by_key(|s| s.0);

    let mut mono_votes = 0usize;
    let mut rgb_votes = 0usize;
    for (i, &(offset, samples)) in spans.iter().enumerate() {
        let next = spans.get(i + 1).map(|s| s.0).unwrap_or(lighting_len);
        let delta = next.saturating_sub(offset);
        if delta == samples {
            mono_votes += 1;
        } else if delta == samples * RGB_SAMPLE_BYTES {
            rgb_votes += 1;
        }
    }

    tracing::debug!(mono_votes, rgb_votes, "lighting sample size inference");
    match mono_votes.cmp(&rgb_votes) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => fallback,
    }
}

fn expand_mono_lighting(mono: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(mono.len() * RGB_SAMPLE_BYTES);
    for &v in mono {
        rgb.extend_from_slice(&[v, v, v]);
    }
    rgb
}

fn average_rgb_lighting(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks(RGB_SAMPLE_BYTES)
        .map(|c| (c.iter().map(|&v| v as u32).sum::<u32>() / c.len() as u32) as u8)
        .collect()
}

pub(crate) fn lump_range(
    data: &[u8],
    id_name: &'static str,
    offset: i32,
    len: i32,
) -> Result<std::ops::Range<usize>, LoadError> {
    let out_of_range = || LoadError::LumpOutOfRange {
        lump: id_name,
        offset: offset as i64,
        len: len as i64,
        file_len: data.len(),
    };
    if offset < 0 || len < 0 {
        return Err(out_of_range());
    }
    let start = offset as usize;
    let end = start.checked_add(len as usize).ok_or_else(out_of_range)?;
    if end > data.len() {
        return Err(out_of_range());
    }
    Ok(start..end)
}

/// Parse a whole file into canonical lumps.
pub fn decode_file(
    data: &[u8],
    profile: &EngineProfile,
) -> Result<(LumpStore, FormatInfo), LoadError> {
    if data.len() < HEADER_SIZE {
        return Err(LoadError::TruncatedHeader { len: data.len() });
    }

    let mut r = ByteReader::new(data);
    let tag = r.i32()?;
    let sub_format = SubFormat::from_tag(tag).ok_or(LoadError::BadVersion(tag))?;
    let layout = Layout::of(sub_format);
    let mut caps = sub_format.layout_capabilities();

    let mut ranges = Vec::with_capacity(HEADER_LUMPS);
    for id in LumpId::ALL {
        let offset = r.i32()?;
        let len = r.i32()?;
        ranges.push(lump_range(data, id.name(), offset, len)?);
    }

    let extra = decode_extra_header(data, &ranges)?;
    if extra.is_some() {
        caps |= Capabilities::EXTENSION_HEADER;
    }

    let raw = |id: LumpId| lump_bytes(data, &ranges, id);
    let mut store = LumpStore::new();

    for id in PASSTHROUGH_LUMPS {
        store.replace(id, raw(id).to_vec()).map_err(funny_size)?;
    }

    let nodes = decode_nodes(raw(LumpId::Nodes), layout)?;
    let leaves = decode_leaves(raw(LumpId::Leaves), layout)?;
    let mut faces = decode_faces(raw(LumpId::Faces), layout)?;
    let mut clipnodes = decode_clipnodes(raw(LumpId::ClipNodes), layout)?;
    let edges = decode_edges(raw(LumpId::Edges), layout)?;
    let marksurfaces = decode_marksurfaces(raw(LumpId::MarkSurfaces), layout)?;

    if layout == Layout::Narrow && fix_unsigned_clipnode_children(&mut clipnodes) {
        tracing::info!(
            clipnodes = clipnodes.len(),
            "corrected unsigned 16-bit clipnode children"
        );
        caps |= Capabilities::CLIPNODE_UNSIGNED_QUIRK;
    }

    let lighting = raw(LumpId::Lighting);
    if !lighting.is_empty() {
        let texinfos = store.records::<TexInfo>();
        let surfedges = store.records::<SurfEdge>();
        let vertices = store.records::<Vertex>();
        let geometry = FaceGeometry {
            texinfos: &texinfos,
            surfedges: &surfedges,
            edges: &edges,
            vertices: &vertices,
        };
        let fallback = sub_format != SubFormat::HalfLife;
        if lighting_is_mono(&faces, &geometry, lighting.len(), fallback) {
            caps |= Capabilities::MONO_LIGHTING;
            for f in faces.iter_mut().filter(|f| f.light_offset >= 0) {
                f.light_offset *= RGB_SAMPLE_BYTES as i32;
            }
            store
                .replace(LumpId::Lighting, expand_mono_lighting(lighting))
                .map_err(funny_size)?;
        }
    } else if sub_format != SubFormat::HalfLife {
        caps |= Capabilities::MONO_LIGHTING;
    }

    let canonical = [
        (LumpId::Nodes, encode_canonical(&nodes)),
        (LumpId::Leaves, encode_canonical(&leaves)),
        (LumpId::Faces, encode_canonical(&faces)),
        (LumpId::ClipNodes, encode_canonical(&clipnodes)),
        (LumpId::Edges, encode_canonical(&edges)),
        (LumpId::MarkSurfaces, encode_canonical(&marksurfaces)),
    ];
    for (id, bytes) in canonical {
        store.replace(id, bytes).map_err(funny_size)?;
    }
    store.set_extra(extra);

    let info = FormatInfo { sub_format, caps };
    tracing::debug!(?sub_format, ?caps, max_leaves = profile.limits.max_leaves, "decoded bsp");
    Ok((store, info))
}

fn lump_bytes<'a>(data: &'a [u8], ranges: &[std::ops::Range<usize>], id: LumpId) -> &'a [u8] {
    &data[ranges[id.index()].clone()]
}

fn funny_size(err: LumpError) -> LoadError {
    match err {
        LumpError::Misaligned {
            lump,
            len,
            record_size,
        } => LoadError::FunnyLumpSize {
            lump,
            len,
            record_size,
        },
    }
}

fn decode_extra_header(
    data: &[u8],
    ranges: &[std::ops::Range<usize>],
) -> Result<Option<ExtraLumps>, LoadError> {
    if data.len() < HEADER_SIZE + EXTRA_HEADER_SIZE {
        return Ok(None);
    }
    // A base lump starting inside the would-be extension header rules it out.
    let ext_end = HEADER_SIZE + EXTRA_HEADER_SIZE;
    if ranges.iter().any(|r| !r.is_empty() && r.start < ext_end) {
        return Ok(None);
    }

    let mut r = ByteReader::at(data, HEADER_SIZE);
    if r.i32()? != IDEXTRAHEADER {
        return Ok(None);
    }
    let version = r.i32()?;
    let mut extra = ExtraLumps {
        version,
        lumps: Default::default(),
    };
    for (index, lump) in extra.lumps.iter_mut().enumerate() {
        let offset = r.i32()?;
        let len = r.i32()?;
        let range = lump_range(data, "extra", offset, len)
            .map_err(|_| LoadError::ExtraLumpOutOfRange { index })?;
        *lump = data[range].to_vec();
    }
    Ok(Some(extra))
}

// ============================================================
// Save
// ============================================================

/// Largest clip-node index the unsigned quirk encoding can carry without
/// colliding with content codes.
pub const MAX_QUIRK_CLIPNODE: i32 = u16::MAX as i32 + CONTENTS_MIN;

struct SaveTables {
    nodes: Vec<Node>,
    leaves: Vec<Leaf>,
    faces: Vec<Face>,
    clipnodes: Vec<ClipNode>,
    edges: Vec<Edge>,
    marksurfaces: Vec<MarkSurface>,
}

impl SaveTables {
    fn from_store(store: &LumpStore) -> Self {
        Self {
            nodes: store.records(),
            leaves: store.records(),
            faces: store.records(),
            clipnodes: store.records(),
            edges: store.records(),
            marksurfaces: store.records(),
        }
    }

    fn bounds_fit_i16(&self) -> bool {
        self.nodes.iter().all(|n| bounds_fit_i16(&n.mins, &n.maxs))
            && self.leaves.iter().all(|l| bounds_fit_i16(&l.mins, &l.maxs))
    }

    /// Every index fits the 16-bit layout.
    fn fits_narrow(&self, allow_quirk: bool) -> bool {
        let u16_max = u16::MAX as u32;
        let child16 = |c: i32| (i16::MIN as i32..=i16::MAX as i32).contains(&c);
        let clip_child = |c: i32| {
            child16(c) || (allow_quirk && c > i16::MAX as i32 && c <= MAX_QUIRK_CLIPNODE)
        };

        self.bounds_fit_i16()
            && self.nodes.iter().all(|n| {
                n.children.iter().all(|&c| child16(c))
                    && n.first_face <= u16_max
                    && n.num_faces <= u16_max
            })
            && self.clipnodes.iter().all(|c| c.children.iter().all(|&ch| clip_child(ch)))
            && self
                .leaves
                .iter()
                .all(|l| l.first_mark_surface <= u16_max && l.num_mark_surfaces <= u16_max)
            && self.faces.iter().all(|f| {
                f.plane <= u16_max
                    && f.side <= u16_max
                    && f.num_edges <= u16_max
                    && f.texinfo <= u16_max
            })
            && self.edges.iter().all(|e| e.v[0] <= u16_max && e.v[1] <= u16_max)
            && self.marksurfaces.iter().all(|m| m.face <= u16_max)
    }
}

/// Pick the sub-format a document will be written as.
pub fn choose_output_format(
    store: &LumpStore,
    info: &FormatInfo,
    profile: &EngineProfile,
) -> SubFormat {
    let tables = SaveTables::from_store(store);
    choose_for_tables(&tables, info, profile)
}

fn choose_for_tables(tables: &SaveTables, info: &FormatInfo, profile: &EngineProfile) -> SubFormat {
    let wide_format = |tables: &SaveTables| {
        if info.sub_format == SubFormat::Bsp2Rmq && tables.bounds_fit_i16() {
            SubFormat::Bsp2Rmq
        } else {
            SubFormat::Bsp2
        }
    };

    if info.sub_format.is_wide() && profile.save.preserve_wide_layout {
        return wide_format(tables);
    }

    let allow_quirk = info.caps.contains(Capabilities::CLIPNODE_UNSIGNED_QUIRK);
    if tables.fits_narrow(allow_quirk) {
        return match info.sub_format {
            SubFormat::Quake | SubFormat::HalfLife => info.sub_format,
            _ if info.caps.contains(Capabilities::MONO_LIGHTING) => SubFormat::Quake,
            _ => SubFormat::HalfLife,
        };
    }

    let out = wide_format(tables);
    tracing::info!(from = ?info.sub_format, to = ?out, "tables exceed the 16-bit layout");
    out
}

fn put_bounds(out: &mut Vec<u8>, layout: Layout, mins: &Vec3, maxs: &Vec3) {
    if layout == Layout::Bsp2 {
        put_vec3(out, mins);
        put_vec3(out, maxs);
    } else {
        put_bounds_i16(out, mins, maxs);
    }
}

fn encode_nodes(nodes: &[Node], layout: Layout) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * layout.record_size(LumpId::Nodes).unwrap_or(0));
    for n in nodes {
        put_u32(&mut out, n.plane);
        if layout == Layout::Narrow {
            put_i16(&mut out, n.children[0] as i16);
            put_i16(&mut out, n.children[1] as i16);
        } else {
            put_i32(&mut out, n.children[0]);
            put_i32(&mut out, n.children[1]);
        }
        put_bounds(&mut out, layout, &n.mins, &n.maxs);
        if layout == Layout::Narrow {
            put_u16(&mut out, n.first_face as u16);
            put_u16(&mut out, n.num_faces as u16);
        } else {
            put_u32(&mut out, n.first_face);
            put_u32(&mut out, n.num_faces);
        }
    }
    out
}

fn encode_leaves(leaves: &[Leaf], layout: Layout) -> Vec<u8> {
    let mut out = Vec::with_capacity(leaves.len() * layout.record_size(LumpId::Leaves).unwrap_or(0));
    for l in leaves {
        put_i32(&mut out, l.contents);
        put_i32(&mut out, l.vis_offset);
        put_bounds(&mut out, layout, &l.mins, &l.maxs);
        if layout == Layout::Narrow {
            put_u16(&mut out, l.first_mark_surface as u16);
            put_u16(&mut out, l.num_mark_surfaces as u16);
        } else {
            put_u32(&mut out, l.first_mark_surface);
            put_u32(&mut out, l.num_mark_surfaces);
        }
        out.extend_from_slice(&l.ambient_levels);
    }
    out
}

fn encode_faces(faces: &[Face], layout: Layout, mono: bool) -> Vec<u8> {
    let narrow = layout == Layout::Narrow;
    let mut out = Vec::with_capacity(faces.len() * layout.record_size(LumpId::Faces).unwrap_or(0));
    for f in faces {
        let light_offset = if mono && f.light_offset >= 0 {
            f.light_offset / RGB_SAMPLE_BYTES as i32
        } else {
            f.light_offset
        };
        if narrow {
            put_u16(&mut out, f.plane as u16);
            put_u16(&mut out, f.side as u16);
            put_u32(&mut out, f.first_edge);
            put_u16(&mut out, f.num_edges as u16);
            put_u16(&mut out, f.texinfo as u16);
        } else {
            put_u32(&mut out, f.plane);
            put_u32(&mut out, f.side);
            put_u32(&mut out, f.first_edge);
            put_u32(&mut out, f.num_edges);
            put_u32(&mut out, f.texinfo);
        }
        out.extend_from_slice(&f.styles);
        put_i32(&mut out, light_offset);
    }
    out
}

fn encode_clipnodes(clipnodes: &[ClipNode], layout: Layout) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(clipnodes.len() * layout.record_size(LumpId::ClipNodes).unwrap_or(0));
    for c in clipnodes {
        put_i32(&mut out, c.plane);
        for &child in &c.children {
            if layout == Layout::Narrow {
                // children past 32767 wrap, which is the quirk encoding
                put_u16(&mut out, child as u16);
            } else {
                put_i32(&mut out, child);
            }
        }
    }
    out
}

fn encode_edges(edges: &[Edge], layout: Layout) -> Vec<u8> {
    let mut out = Vec::with_capacity(edges.len() * layout.record_size(LumpId::Edges).unwrap_or(0));
    for e in edges {
        if layout == Layout::Narrow {
            put_u16(&mut out, e.v[0] as u16);
            put_u16(&mut out, e.v[1] as u16);
        } else {
            put_u32(&mut out, e.v[0]);
            put_u32(&mut out, e.v[1]);
        }
    }
    out
}

fn encode_marksurfaces(marksurfaces: &[MarkSurface], layout: Layout) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        marksurfaces.len() * layout.record_size(LumpId::MarkSurfaces).unwrap_or(0),
    );
    for m in marksurfaces {
        if layout == Layout::Narrow {
            put_u16(&mut out, m.face as u16);
        } else {
            put_u32(&mut out, m.face);
        }
    }
    out
}

/// Serialize canonical lumps into a complete file. Returns the bytes and the
/// sub-format they were written as.
pub fn encode_file(
    store: &LumpStore,
    info: &FormatInfo,
    profile: &EngineProfile,
) -> (Vec<u8>, SubFormat) {
    let tables = SaveTables::from_store(store);
    let sub_format = choose_for_tables(&tables, info, profile);
    let layout = Layout::of(sub_format);
    let mono = info.caps.contains(Capabilities::MONO_LIGHTING);

    let mut lumps: Vec<Vec<u8>> = LumpId::ALL.iter().map(|&id| store.get(id).to_vec()).collect();
    lumps[LumpId::Nodes.index()] = encode_nodes(&tables.nodes, layout);
    lumps[LumpId::Leaves.index()] = encode_leaves(&tables.leaves, layout);
    lumps[LumpId::Faces.index()] = encode_faces(&tables.faces, layout, mono);
    lumps[LumpId::ClipNodes.index()] = encode_clipnodes(&tables.clipnodes, layout);
    lumps[LumpId::Edges.index()] = encode_edges(&tables.edges, layout);
    lumps[LumpId::MarkSurfaces.index()] = encode_marksurfaces(&tables.marksurfaces, layout);
    if mono {
        lumps[LumpId::Lighting.index()] = average_rgb_lighting(store.get(LumpId::Lighting));
    }

    let extra = store.extra();
    let header_len = HEADER_SIZE + if extra.is_some() { EXTRA_HEADER_SIZE } else { 0 };
    let body_len: usize = lumps.iter().map(|l| (l.len() + 3) & !3).sum::<usize>()
        + extra.map_or(0, |e| e.lumps.iter().map(|l| (l.len() + 3) & !3).sum::<usize>());

    let mut out = Vec::with_capacity(header_len + body_len);
    out.resize(header_len, 0);

    let mut directory = Vec::with_capacity(HEADER_LUMPS);
    for lump in &lumps {
        directory.push((out.len() as i32, lump.len() as i32));
        out.extend_from_slice(lump);
        pad4(&mut out);
    }
    let mut extra_directory = Vec::new();
    if let Some(extra) = extra {
        for lump in &extra.lumps {
            extra_directory.push((out.len() as i32, lump.len() as i32));
            out.extend_from_slice(lump);
            pad4(&mut out);
        }
    }

    let mut header = Vec::with_capacity(header_len);
    put_i32(&mut header, sub_format.tag());
    for (offset, len) in &directory {
        put_i32(&mut header, *offset);
        put_i32(&mut header, *len);
    }
    if let Some(extra) = extra {
        put_i32(&mut header, IDEXTRAHEADER);
        put_i32(&mut header, extra.version);
        for (offset, len) in &extra_directory {
            put_i32(&mut header, *offset);
            put_i32(&mut header, *len);
        }
    }
    out[..header_len].copy_from_slice(&header);

    (out, sub_format)
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a file from (lump, bytes) pairs with a raw version tag.
    fn build_file(tag: i32, lumps: &[(LumpId, Vec<u8>)]) -> Vec<u8> {
        let mut body: Vec<Vec<u8>> = vec![Vec::new(); HEADER_LUMPS];
        for (id, bytes) in lumps {
            body[id.index()] = bytes.clone();
        }
        let mut out = vec![0u8; HEADER_SIZE];
        let mut header = Vec::new();
        put_i32(&mut header, tag);
        for lump in &body {
            header.extend_from_slice(&(out.len() as i32).to_le_bytes());
            header.extend_from_slice(&(lump.len() as i32).to_le_bytes());
            out.extend_from_slice(lump);
            pad4(&mut out);
        }
        out[..HEADER_SIZE].copy_from_slice(&header);
        out
    }

    fn narrow_clipnode(plane: i32, a: i16, b: i16) -> Vec<u8> {
        let mut out = Vec::new();
        put_i32(&mut out, plane);
        put_i16(&mut out, a);
        put_i16(&mut out, b);
        out
    }

    #[test]
    fn rejects_short_file_and_bad_tag() {
        let profile = EngineProfile::default();
        assert!(matches!(
            decode_file(&[0u8; 10], &profile),
            Err(LoadError::TruncatedHeader { len: 10 })
        ));
        let file = build_file(38, &[]);
        assert!(matches!(decode_file(&file, &profile), Err(LoadError::BadVersion(38))));
    }

    #[test]
    fn rejects_lump_past_end() {
        let mut file = build_file(BSPVERSION_HALFLIFE, &[]);
        let planes = 4 + LumpId::Planes.index() * 8;
        file[planes + 4..planes + 8].copy_from_slice(&1000i32.to_le_bytes());
        assert!(matches!(
            decode_file(&file, &EngineProfile::default()),
            Err(LoadError::LumpOutOfRange { lump: "planes", .. })
        ));
    }

    #[test]
    fn rejects_funny_lump_size() {
        let file = build_file(BSPVERSION_HALFLIFE, &[(LumpId::ClipNodes, vec![0u8; 10])]);
        assert!(matches!(
            decode_file(&file, &EngineProfile::default()),
            Err(LoadError::FunnyLumpSize { lump: "clipnodes", len: 10, record_size: 8 })
        ));
    }

    #[test]
    fn narrow_clipnodes_widen_and_narrow_again() {
        let mut raw = narrow_clipnode(0, 1, CONTENTS_EMPTY as i16);
        raw.extend(narrow_clipnode(1, CONTENTS_SOLID as i16, CONTENTS_EMPTY as i16));
        let file = build_file(BSPVERSION_HALFLIFE, &[(LumpId::ClipNodes, raw.clone())]);
        let profile = EngineProfile::default();

        let (store, info) = decode_file(&file, &profile).unwrap();
        assert_eq!(info.sub_format, SubFormat::HalfLife);
        let clip: Vec<ClipNode> = store.records();
        assert_eq!(clip[0].children, [1, CONTENTS_EMPTY]);
        assert_eq!(store.len(LumpId::ClipNodes), 2 * ClipNode::SIZE);

        let (out, written) = encode_file(&store, &info, &profile);
        assert_eq!(written, SubFormat::HalfLife);
        assert_eq!(out, file);
    }

    #[test]
    fn unsigned_clipnode_quirk_is_detected_and_restored() {
        let count = 40000usize;
        let mut raw = Vec::with_capacity(count * 8);
        for i in 0..count {
            let next = if i + 1 < count { (i + 1) as u16 as i16 } else { CONTENTS_SOLID as i16 };
            raw.extend(narrow_clipnode(0, next, CONTENTS_EMPTY as i16));
        }
        let file = build_file(BSPVERSION_HALFLIFE, &[(LumpId::ClipNodes, raw)]);
        let profile = EngineProfile::default();

        let (store, info) = decode_file(&file, &profile).unwrap();
        assert!(info.caps.contains(Capabilities::CLIPNODE_UNSIGNED_QUIRK));
        let clip: Vec<ClipNode> = store.records();
        assert_eq!(clip[32767].children[0], 32768);
        assert_eq!(clip[39998].children[0], 39999);

        let (out, written) = encode_file(&store, &info, &profile);
        assert_eq!(written, SubFormat::HalfLife);
        assert_eq!(out, file);
    }

    #[test]
    fn oversized_tables_promote_to_bsp2() {
        let mut store = LumpStore::new();
        let edges = vec![Edge { v: [0, 70000] }];
        store.replace(LumpId::Edges, encode_canonical(&edges)).unwrap();
        let info = FormatInfo::new(SubFormat::HalfLife);
        let (out, written) = encode_file(&store, &info, &EngineProfile::default());
        assert_eq!(written, SubFormat::Bsp2);
        assert_eq!(&out[..4], b"BSP2");
    }

    #[test]
    fn wide_layout_preserved_unless_disabled() {
        let file = build_file(BSP2_HEADER, &[]);
        let mut profile = EngineProfile::default();
        let (store, info) = decode_file(&file, &profile).unwrap();
        assert!(info.caps.contains(Capabilities::WIDE_INDICES | Capabilities::FLOAT_BOUNDS));
        assert_eq!(encode_file(&store, &info, &profile).1, SubFormat::Bsp2);

        profile.save.preserve_wide_layout = false;
        // BSP2 is a Quake-family format, so empty lighting means monochrome
        assert_eq!(encode_file(&store, &info, &profile).1, SubFormat::Quake);
    }

    #[test]
    fn mono_lighting_is_expanded_and_averaged_back() {
        // one 16x16 face -> 2x2 samples, one style
        let verts: Vec<u8> = [[0.0f32, 0.0, 0.0], [16.0, 0.0, 0.0], [16.0, 16.0, 0.0]]
            .iter()
            .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
            .collect();
        let mut edges = Vec::new();
        for (a, b) in [(0u16, 0u16), (0, 1), (1, 2), (2, 0)] {
            put_u16(&mut edges, a);
            put_u16(&mut edges, b);
        }
        let mut surfedges = Vec::new();
        for e in 1..=3 {
            put_i32(&mut surfedges, e);
        }
        let mut texinfo = Vec::new();
        TexInfo {
            vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
            miptex: 0,
            flags: 0,
        }
        .encode(&mut texinfo);
        let mut faces = Vec::new();
        for light_offset in [0i32, 4] {
            put_u16(&mut faces, 0);
            put_u16(&mut faces, 0);
            put_u32(&mut faces, 0);
            put_u16(&mut faces, 3);
            put_u16(&mut faces, 0);
            faces.extend_from_slice(&[0, 255, 255, 255]);
            put_i32(&mut faces, light_offset);
        }
        let lighting = vec![10u8, 20, 30, 40, 50, 60, 70, 80];

        let file = build_file(
            BSPVERSION_QUAKE,
            &[
                (LumpId::Vertices, verts),
                (LumpId::Edges, edges),
                (LumpId::SurfEdges, surfedges),
                (LumpId::TexInfo, texinfo),
                (LumpId::Faces, faces),
                (LumpId::Lighting, lighting.clone()),
            ],
        );
        let profile = EngineProfile::default();
        let (store, info) = decode_file(&file, &profile).unwrap();
        assert!(info.caps.contains(Capabilities::MONO_LIGHTING));
        assert_eq!(store.len(LumpId::Lighting), lighting.len() * 3);
        let faces: Vec<Face> = store.records();
        assert_eq!(faces[1].light_offset, 12);

        let (out, _) = encode_file(&store, &info, &profile);
        assert_eq!(out, file);
    }

    #[test]
    fn rgb_lighting_stays_rgb() {
        let face = Face {
            num_edges: 3,
            styles: [0, 255, 255, 255],
            light_offset: 0,
            ..Face::default()
        };
        let verts = [
            Vertex { point: [0.0, 0.0, 0.0] },
            Vertex { point: [16.0, 0.0, 0.0] },
            Vertex { point: [16.0, 16.0, 0.0] },
        ];
        let edges = [Edge { v: [0, 1] }, Edge { v: [1, 2] }, Edge { v: [2, 0] }];
        let surfedges = [SurfEdge { edge: 0 }, SurfEdge { edge: 1 }, SurfEdge { edge: 2 }];
        let texinfos = [TexInfo {
            vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
            miptex: 0,
            flags: 0,
        }];
        let geo = FaceGeometry {
            texinfos: &texinfos,
            surfedges: &surfedges,
            edges: &edges,
            vertices: &verts,
        };
        assert!(!lighting_is_mono(&[face], &geo, 12, true));
        assert!(lighting_is_mono(&[face], &geo, 4, false));
        // no evidence either way
        assert!(lighting_is_mono(&[face], &geo, 7, true));
    }

    #[test]
    fn extension_header_is_passed_through() {
        let mut file = vec![0u8; HEADER_SIZE + EXTRA_HEADER_SIZE];
        let mut header = Vec::new();
        put_i32(&mut header, BSPVERSION_HALFLIFE);
        let body_start = file.len() as i32;
        for _ in 0..HEADER_LUMPS {
            put_i32(&mut header, body_start);
            put_i32(&mut header, 0);
        }
        put_i32(&mut header, IDEXTRAHEADER);
        put_i32(&mut header, EXTRA_VERSION);
        put_i32(&mut header, body_start);
        put_i32(&mut header, 4);
        for _ in 1..EXTRA_LUMPS {
            put_i32(&mut header, body_start + 4);
            put_i32(&mut header, 0);
        }
        file[..header.len()].copy_from_slice(&header);
        file.extend_from_slice(&[1, 2, 3, 4]);

        let profile = EngineProfile::default();
        let (store, info) = decode_file(&file, &profile).unwrap();
        assert!(info.caps.contains(Capabilities::EXTENSION_HEADER));
        let extra = store.extra().unwrap();
        assert_eq!(extra.version, EXTRA_VERSION);
        assert_eq!(extra.lumps[0], vec![1, 2, 3, 4]);

        let (out, _) = encode_file(&store, &info, &profile);
        let (again, _) = decode_file(&out, &profile).unwrap();
        assert_eq!(again.extra(), store.extra());
    }
}
