// lump.rs -- ownership of the raw lump buffers and the directory bookkeeping

use bitflags::bitflags;

use crate::bspfile::{
    ClipNode, Edge, Face, Leaf, MarkSurface, Model, Node, Plane, Record, SurfEdge, TexInfo,
    Vertex, EXTRA_LUMPS, HEADER_LUMPS,
};
use crate::error::LumpError;

/// The fifteen fixed lumps, in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LumpId {
    Entities = 0,
    Planes = 1,
    Textures = 2,
    Vertices = 3,
    Visibility = 4,
    Nodes = 5,
    TexInfo = 6,
    Faces = 7,
    Lighting = 8,
    ClipNodes = 9,
    Leaves = 10,
    MarkSurfaces = 11,
    Edges = 12,
    SurfEdges = 13,
    Models = 14,
}

impl LumpId {
    pub const ALL: [LumpId; HEADER_LUMPS] = [
        LumpId::Entities,
        LumpId::Planes,
        LumpId::Textures,
        LumpId::Vertices,
        LumpId::Visibility,
        LumpId::Nodes,
        LumpId::TexInfo,
        LumpId::Faces,
        LumpId::Lighting,
        LumpId::ClipNodes,
        LumpId::Leaves,
        LumpId::MarkSurfaces,
        LumpId::Edges,
        LumpId::SurfEdges,
        LumpId::Models,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            LumpId::Entities => "entities",
            LumpId::Planes => "planes",
            LumpId::Textures => "textures",
            LumpId::Vertices => "vertices",
            LumpId::Visibility => "visibility",
            LumpId::Nodes => "nodes",
            LumpId::TexInfo => "texinfo",
            LumpId::Faces => "faces",
            LumpId::Lighting => "lighting",
            LumpId::ClipNodes => "clipnodes",
            LumpId::Leaves => "leaves",
            LumpId::MarkSurfaces => "marksurfaces",
            LumpId::Edges => "edges",
            LumpId::SurfEdges => "surfedges",
            LumpId::Models => "models",
        }
    }

    /// Canonical record size for typed lumps, `None` for blobs.
    pub fn record_size(self) -> Option<usize> {
        match self {
            LumpId::Planes => Some(Plane::SIZE),
            LumpId::Vertices => Some(Vertex::SIZE),
            LumpId::Nodes => Some(Node::SIZE),
            LumpId::TexInfo => Some(TexInfo::SIZE),
            LumpId::Faces => Some(Face::SIZE),
            LumpId::ClipNodes => Some(ClipNode::SIZE),
            LumpId::Leaves => Some(Leaf::SIZE),
            LumpId::MarkSurfaces => Some(MarkSurface::SIZE),
            LumpId::Edges => Some(Edge::SIZE),
            LumpId::SurfEdges => Some(SurfEdge::SIZE),
            LumpId::Models => Some(Model::SIZE),
            LumpId::Entities | LumpId::Textures | LumpId::Visibility | LumpId::Lighting => None,
        }
    }

    pub fn mask(self) -> LumpMask {
        LumpMask::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    /// Set of lumps, used for snapshots and for choosing what `collect` compacts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LumpMask: u32 {
        const ENTITIES = 1 << 0;
        const PLANES = 1 << 1;
        const TEXTURES = 1 << 2;
        const VERTICES = 1 << 3;
        const VISIBILITY = 1 << 4;
        const NODES = 1 << 5;
        const TEXINFO = 1 << 6;
        const FACES = 1 << 7;
        const LIGHTING = 1 << 8;
        const CLIPNODES = 1 << 9;
        const LEAVES = 1 << 10;
        const MARKSURFACES = 1 << 11;
        const EDGES = 1 << 12;
        const SURFEDGES = 1 << 13;
        const MODELS = 1 << 14;
    }
}

impl LumpMask {
    pub fn contains_lump(&self, id: LumpId) -> bool {
        self.contains(id.mask())
    }

    pub fn lumps(&self) -> impl Iterator<Item = LumpId> + '_ {
        LumpId::ALL.into_iter().filter(|id| self.contains_lump(*id))
    }
}

/// Copy of a subset of lumps, taken before a risky edit.
#[derive(Debug, Clone)]
pub struct LumpSnapshot {
    mask: LumpMask,
    lumps: Vec<(LumpId, Vec<u8>)>,
}

impl LumpSnapshot {
    pub fn mask(&self) -> LumpMask {
        self.mask
    }
}

/// Owns every lump buffer of one document.
///
/// Typed views borrow from the store, so a view can never outlive a
/// `replace`/`append` on the same store.
#[derive(Debug, Clone, Default)]
pub struct LumpStore {
    lumps: [Vec<u8>; HEADER_LUMPS],
    /// Extension-header lumps, kept as opaque blobs.
    extra: Option<ExtraLumps>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraLumps {
    pub version: i32,
    pub lumps: [Vec<u8>; EXTRA_LUMPS],
}

impl LumpStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, id: LumpId) -> &[u8] {
        &self.lumps[id.index()]
    }

    /// Directory length of a lump, in bytes.
    #[inline]
    pub fn len(&self, id: LumpId) -> usize {
        self.lumps[id.index()].len()
    }

    pub fn is_empty(&self, id: LumpId) -> bool {
        self.lumps[id.index()].is_empty()
    }

    /// Number of canonical records in a typed lump.
    pub fn count(&self, id: LumpId) -> usize {
        match id.record_size() {
            Some(size) => self.len(id) / size,
            None => 0,
        }
    }

    /// Take ownership of `bytes` as the new contents of `id`. The previous
    /// buffer is dropped.
    pub fn replace(&mut self, id: LumpId, bytes: Vec<u8>) -> Result<(), LumpError> {
        if let Some(size) = id.record_size() {
            if bytes.len() % size != 0 {
                return Err(LumpError::Misaligned {
                    lump: id.name(),
                    len: bytes.len(),
                    record_size: size,
                });
            }
        }
        tracing::trace!(lump = id.name(), old = self.len(id), new = bytes.len(), "replace lump");
        self.lumps[id.index()] = bytes;
        Ok(())
    }

    /// Replace a blob lump (entities, textures, lighting, visibility).
    /// Blobs have no record size, so there is nothing to reject.
    pub fn put_blob(&mut self, id: LumpId, bytes: Vec<u8>) {
        debug_assert!(id.record_size().is_none(), "{} holds records", id.name());
        tracing::trace!(lump = id.name(), old = self.len(id), new = bytes.len(), "put blob");
        self.lumps[id.index()] = bytes;
    }

    /// Replace with the old contents followed by `bytes`.
    pub fn append(&mut self, id: LumpId, bytes: &[u8]) -> Result<(), LumpError> {
        let old = self.get(id);
        let mut joined = Vec::with_capacity(old.len() + bytes.len());
        joined.extend_from_slice(old);
        joined.extend_from_slice(bytes);
        self.replace(id, joined)
    }

    /// Decode every record of a typed lump.
    pub fn records<T: Record>(&self) -> Vec<T> {
        self.get(T::LUMP).chunks_exact(T::SIZE).map(T::decode).collect()
    }

    /// Replace a typed lump with encoded records. Whole records by
    /// construction, so this can't fail the alignment check.
    pub fn put_records<T: Record>(&mut self, records: &[T]) {
        let mut bytes = Vec::with_capacity(records.len() * T::SIZE);
        for r in records {
            r.encode(&mut bytes);
        }
        tracing::trace!(lump = T::LUMP.name(), old = self.len(T::LUMP), new = bytes.len(), "put records");
        self.lumps[T::LUMP.index()] = bytes;
    }

    /// Append records to a typed lump, returning the index of the first one.
    pub fn push_records<T: Record>(&mut self, records: &[T]) -> usize {
        let first = self.count(T::LUMP);
        let buf = &mut self.lumps[T::LUMP.index()];
        buf.reserve(records.len() * T::SIZE);
        for r in records {
            r.encode(buf);
        }
        first
    }

    /// Overwrite one record in place. False when `index` is out of range.
    pub fn set_record<T: Record>(&mut self, index: usize, record: &T) -> bool {
        let start = index * T::SIZE;
        let buf = &mut self.lumps[T::LUMP.index()];
        let Some(slot) = buf.get_mut(start..start + T::SIZE) else {
            return false;
        };
        let mut encoded = Vec::with_capacity(T::SIZE);
        record.encode(&mut encoded);
        slot.copy_from_slice(&encoded);
        true
    }

    pub fn snapshot(&self, mask: LumpMask) -> LumpSnapshot {
        LumpSnapshot {
            mask,
            lumps: mask.lumps().map(|id| (id, self.get(id).to_vec())).collect(),
        }
    }

    pub fn restore(&mut self, snapshot: LumpSnapshot) {
        for (id, bytes) in snapshot.lumps {
            self.lumps[id.index()] = bytes;
        }
    }

    pub fn extra(&self) -> Option<&ExtraLumps> {
        self.extra.as_ref()
    }

    pub fn set_extra(&mut self, extra: Option<ExtraLumps>) {
        self.extra = extra;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_rejects_partial_records() {
        let mut store = LumpStore::new();
        let err = store.replace(LumpId::Planes, vec![0u8; 21]).unwrap_err();
        assert!(matches!(err, LumpError::Misaligned { record_size: 20, .. }));
        assert!(store.is_empty(LumpId::Planes));

        store.replace(LumpId::Planes, vec![0u8; 40]).unwrap();
        assert_eq!(store.count(LumpId::Planes), 2);
    }

    #[test]
    fn blobs_accept_any_length() {
        let mut store = LumpStore::new();
        store.replace(LumpId::Lighting, vec![1, 2, 3]).unwrap();
        store.append(LumpId::Lighting, &[4, 5]).unwrap();
        assert_eq!(store.get(LumpId::Lighting), &[1, 2, 3, 4, 5]);
        assert_eq!(store.count(LumpId::Lighting), 0);

        store.put_blob(LumpId::Visibility, vec![7; 13]);
        assert_eq!(store.len(LumpId::Visibility), 13);
    }

    #[test]
    fn snapshot_restores_only_masked_lumps() {
        let mut store = LumpStore::new();
        store.replace(LumpId::Lighting, vec![1, 2, 3]).unwrap();
        store.replace(LumpId::Visibility, vec![9]).unwrap();

        let snap = store.snapshot(LumpMask::LIGHTING);
        store.replace(LumpId::Lighting, vec![]).unwrap();
        store.replace(LumpId::Visibility, vec![8, 8]).unwrap();
        store.restore(snap);

        assert_eq!(store.get(LumpId::Lighting), &[1, 2, 3]);
        assert_eq!(store.get(LumpId::Visibility), &[8, 8]);
    }

    #[test]
    fn put_records_then_records() {
        let mut store = LumpStore::new();
        let edges = vec![Edge { v: [0, 0] }, Edge { v: [3, 9] }];
        store.put_records(&edges);
        assert_eq!(store.count(LumpId::Edges), 2);
        assert_eq!(store.records::<Edge>(), edges);

        assert_eq!(store.push_records(&[Edge { v: [4, 5] }]), 2);
        assert!(store.set_record(0, &Edge { v: [1, 1] }));
        assert!(!store.set_record(3, &Edge { v: [1, 1] }));
        assert_eq!(
            store.records::<Edge>(),
            vec![Edge { v: [1, 1] }, Edge { v: [3, 9] }, Edge { v: [4, 5] }]
        );
    }

    #[test]
    fn mask_bits_follow_header_order() {
        for id in LumpId::ALL {
            assert_eq!(id.mask().bits(), 1 << id.index());
        }
        let lumps: Vec<_> = (LumpMask::FACES | LumpMask::PLANES).lumps().collect();
        assert_eq!(lumps, vec![LumpId::Planes, LumpId::Faces]);
    }
}
