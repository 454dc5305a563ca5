// document.rs -- a loaded BSP: lump store, detected format, engine profile
//
// Typed tables are read through `Table` views that borrow the document, so
// no view can be held across a call that replaces or grows a lump. Edits go
// through the owned-record helpers (`records`, `set_records`, `push_record`).

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use crate::bspfile::{Leaf, Model, Record, CONTENTS_EMPTY};
use crate::entity::{parse_entity_lump, serialize_entities, Entity};
use crate::error::{EditError, LoadError};
use crate::lump::{LumpId, LumpStore};
use crate::normalize::{self, FormatInfo, SubFormat};
use crate::profile::EngineProfile;
use crate::progress::Progress;
use crate::texture::TextureDirectory;

// ============================================================
// Typed views
// ============================================================

/// Read-only typed view of one lump.
pub struct Table<'a, T: Record> {
    bytes: &'a [u8],
    _marker: PhantomData<T>,
}

impl<'a, T: Record> Clone for Table<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: Record> Copy for Table<'a, T> {}

impl<'a, T: Record + 'a> Table<'a, T> {
    pub fn new(store: &'a LumpStore) -> Self {
        Self {
            bytes: store.get(T::LUMP),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() / T::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::SIZE)?;
        self.bytes.get(start..start + T::SIZE).map(T::decode)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a {
        self.bytes.chunks_exact(T::SIZE).map(T::decode)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

// ============================================================
// Document
// ============================================================

pub struct Document {
    lumps: LumpStore,
    format: FormatInfo,
    profile: EngineProfile,
    progress: Arc<Progress>,
}

impl Document {
    /// A minimal valid map: the solid sentinel leaf, a world model whose
    /// render tree is that leaf and whose hulls are empty, a worldspawn
    /// entity and an empty texture directory.
    pub fn new_empty(sub_format: SubFormat) -> Self {
        let mut lumps = LumpStore::new();
        lumps.put_records(&[Leaf::default()]);
        lumps.put_records(&[Model {
            headnodes: [-1, CONTENTS_EMPTY, CONTENTS_EMPTY, CONTENTS_EMPTY],
            ..Model::default()
        }]);

        let mut doc = Self {
            lumps,
            format: FormatInfo::new(sub_format),
            profile: EngineProfile::default(),
            progress: Progress::new(),
        };
        doc.set_entities(&[Entity::with_classname("worldspawn")]);
        doc.set_textures(&TextureDirectory::default());
        doc
    }

    pub fn from_bytes(data: &[u8], profile: &EngineProfile) -> Result<Self, LoadError> {
        let (lumps, format) = normalize::decode_file(data, profile)?;
        Ok(Self {
            lumps,
            format,
            profile: *profile,
            progress: Progress::new(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::load_with_profile(path, &EngineProfile::default())
    }

    pub fn load_with_profile(
        path: impl AsRef<Path>,
        profile: &EngineProfile,
    ) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let doc = Self::from_bytes(&data, profile).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to load bsp");
            e
        })?;
        tracing::info!(
            path = %path.display(),
            format = ?doc.format.sub_format,
            models = doc.model_count(),
            "loaded bsp"
        );
        Ok(doc)
    }

    /// Serialize in the narrowest layout that fits.
    pub fn to_bytes(&self) -> Vec<u8> {
        normalize::encode_file(&self.lumps, &self.format, &self.profile).0
    }

    /// The sub-format `to_bytes` would write right now.
    pub fn output_format(&self) -> SubFormat {
        normalize::choose_output_format(&self.lumps, &self.format, &self.profile)
    }

    /// Write to `path` and return the bytes written.
    ///
    /// Tables over the profile's limits are logged at error level and the
    /// file is still written: an engine with larger limits can load it. Call
    /// [`crate::validate::check_limits`] first to refuse such documents.
    pub fn write(&self, path: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
        let path = path.as_ref();
        for finding in crate::validate::check_limits(self) {
            tracing::error!(path = %path.display(), "{finding}");
        }
        let (bytes, sub_format) = normalize::encode_file(&self.lumps, &self.format, &self.profile);
        std::fs::write(path, &bytes)?;
        tracing::info!(path = %path.display(), ?sub_format, len = bytes.len(), "wrote bsp");
        Ok(bytes)
    }

    // --------------------------------------------------------
    // Accessors
    // --------------------------------------------------------

    pub fn lumps(&self) -> &LumpStore {
        &self.lumps
    }

    pub fn lumps_mut(&mut self) -> &mut LumpStore {
        &mut self.lumps
    }

    pub fn format(&self) -> &FormatInfo {
        &self.format
    }

    pub fn profile(&self) -> &EngineProfile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: EngineProfile) {
        self.profile = profile;
    }

    /// Shared progress state, for polling from another thread.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    // --------------------------------------------------------
    // Records
    // --------------------------------------------------------

    pub fn table<'a, T: Record + 'a>(&'a self) -> Table<'a, T> {
        Table::new(&self.lumps)
    }

    pub fn count<T: Record>(&self) -> usize {
        self.lumps.count(T::LUMP)
    }

    pub fn records<T: Record>(&self) -> Vec<T> {
        self.lumps.records()
    }

    pub fn set_records<T: Record>(&mut self, records: &[T]) {
        self.lumps.put_records(records);
    }

    pub fn record<T: Record>(&self, index: usize) -> Option<T> {
        self.table::<T>().get(index)
    }

    pub fn set_record<T: Record>(&mut self, index: usize, record: &T) -> bool {
        self.lumps.set_record(index, record)
    }

    /// Append one record and return its index.
    pub fn push_record<T: Record>(&mut self, record: T) -> usize {
        self.lumps.push_records(&[record])
    }

    /// Append records and return the index of the first.
    pub fn push_records<T: Record>(&mut self, records: &[T]) -> usize {
        self.lumps.push_records(records)
    }

    pub fn model_count(&self) -> usize {
        self.count::<Model>()
    }

    pub fn model(&self, index: usize) -> Result<Model, EditError> {
        self.record(index).ok_or(EditError::BadModel {
            index,
            count: self.model_count(),
        })
    }

    /// Leaves covered by visibility rows; leaf 0 has none.
    pub fn vis_leaf_count(&self) -> usize {
        self.count::<Leaf>().saturating_sub(1)
    }

    // --------------------------------------------------------
    // Entities and textures
    // --------------------------------------------------------

    pub fn entities(&self) -> Vec<Entity> {
        parse_entity_lump(self.lumps.get(LumpId::Entities))
    }

    pub fn set_entities(&mut self, entities: &[Entity]) {
        self.lumps.put_blob(LumpId::Entities, serialize_entities(entities));
    }

    /// The miptex directory. A malformed directory reads as empty.
    pub fn textures(&self) -> TextureDirectory {
        TextureDirectory::parse(self.lumps.get(LumpId::Textures)).unwrap_or_else(|o| {
            tracing::warn!(at = o.at, len = o.len, "malformed texture directory");
            TextureDirectory::default()
        })
    }

    pub fn set_textures(&mut self, textures: &TextureDirectory) {
        self.lumps.put_blob(LumpId::Textures, textures.encode());
    }
}
