// profile.rs -- engine limits, hull sizes and save options
//
// What used to be adjustable global limit constants is one value passed to
// loading, saving and every capacity check.

use serde::{Deserialize, Serialize};

use crate::bspfile::MAX_MAP_HULLS;
use crate::error::ProfileError;
use crate::lump::LumpId;
use crate::mathlib::Vec3;

/// Per-table maxima of the target engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineLimits {
    pub max_planes: usize,
    pub max_nodes: usize,
    pub max_clipnodes: usize,
    pub max_leaves: usize,
    pub max_faces: usize,
    pub max_edges: usize,
    pub max_surfedges: usize,
    pub max_marksurfaces: usize,
    pub max_vertices: usize,
    pub max_texinfos: usize,
    pub max_models: usize,
    pub max_textures: usize,
    pub max_lighting: usize,
    pub max_visdata: usize,
    pub max_entdata: usize,
    pub max_map_coord: f32,
}

impl EngineLimits {
    pub const fn half_life() -> Self {
        Self {
            max_planes: 32768,
            max_nodes: 32767,
            max_clipnodes: 32767,
            max_leaves: 8192,
            max_faces: 65535,
            max_edges: 256000,
            max_surfedges: 512000,
            max_marksurfaces: 65535,
            max_vertices: 65535,
            max_texinfos: 32767,
            max_models: 400,
            max_textures: 512,
            max_lighting: 0x600000,
            max_visdata: 0x400000,
            max_entdata: 0x200000,
            max_map_coord: 32767.0,
        }
    }

    pub const fn quake() -> Self {
        Self {
            max_planes: 32767,
            max_nodes: 32767,
            max_clipnodes: 32767,
            max_leaves: 8192,
            max_faces: 65535,
            max_edges: 256000,
            max_surfedges: 512000,
            max_marksurfaces: 65535,
            max_vertices: 65535,
            max_texinfos: 4096,
            max_models: 256,
            max_textures: 512,
            max_lighting: 0x100000,
            max_visdata: 0x100000,
            max_entdata: 0x10000,
            max_map_coord: 4096.0,
        }
    }

    pub const fn sven_coop() -> Self {
        Self {
            max_planes: 65535,
            max_nodes: 32768,
            max_clipnodes: 32767,
            max_leaves: 65536,
            max_faces: 65535,
            max_edges: 256000,
            max_surfedges: 512000,
            max_marksurfaces: 65535,
            max_vertices: 65535,
            max_texinfos: 32767,
            max_models: 4096,
            max_textures: 4096,
            max_lighting: 0x3000000,
            max_visdata: 0x1000000,
            max_entdata: 0x200000,
            max_map_coord: 32767.0,
        }
    }

    /// Maximum for one lump. Record lumps count records, blobs count bytes.
    pub fn max_for(&self, id: LumpId) -> usize {
        match id {
            LumpId::Entities => self.max_entdata,
            LumpId::Planes => self.max_planes,
            LumpId::Textures => self.max_textures,
            LumpId::Vertices => self.max_vertices,
            LumpId::Visibility => self.max_visdata,
            LumpId::Nodes => self.max_nodes,
            LumpId::TexInfo => self.max_texinfos,
            LumpId::Faces => self.max_faces,
            LumpId::Lighting => self.max_lighting,
            LumpId::ClipNodes => self.max_clipnodes,
            LumpId::Leaves => self.max_leaves,
            LumpId::MarkSurfaces => self.max_marksurfaces,
            LumpId::Edges => self.max_edges,
            LumpId::SurfEdges => self.max_surfedges,
            LumpId::Models => self.max_models,
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::half_life()
    }
}

/// Collision box of the entity size class each hull is built for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HullSizes {
    pub mins: [Vec3; MAX_MAP_HULLS],
    pub maxs: [Vec3; MAX_MAP_HULLS],
}

impl HullSizes {
    pub const fn half_life() -> Self {
        Self {
            mins: [
                [0.0, 0.0, 0.0],
                [-16.0, -16.0, -36.0],
                [-32.0, -32.0, -32.0],
                [-16.0, -16.0, -18.0],
            ],
            maxs: [
                [0.0, 0.0, 0.0],
                [16.0, 16.0, 36.0],
                [32.0, 32.0, 32.0],
                [16.0, 16.0, 18.0],
            ],
        }
    }

    pub const fn quake() -> Self {
        Self {
            mins: [
                [0.0, 0.0, 0.0],
                [-16.0, -16.0, -24.0],
                [-32.0, -32.0, -24.0],
                [0.0, 0.0, 0.0],
            ],
            maxs: [
                [0.0, 0.0, 0.0],
                [16.0, 16.0, 32.0],
                [32.0, 32.0, 64.0],
                [0.0, 0.0, 0.0],
            ],
        }
    }
}

impl Default for HullSizes {
    fn default() -> Self {
        Self::half_life()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Documents loaded in a wide layout are written wide even when the
    /// tables would fit the 16-bit layout.
    pub preserve_wide_layout: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            preserve_wide_layout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineProfile {
    pub limits: EngineLimits,
    pub hulls: HullSizes,
    pub save: SaveOptions,
}

impl EngineProfile {
    pub fn half_life() -> Self {
        Self::default()
    }

    pub fn quake() -> Self {
        Self {
            limits: EngineLimits::quake(),
            hulls: HullSizes::quake(),
            save: SaveOptions::default(),
        }
    }

    pub fn sven_coop() -> Self {
        Self {
            limits: EngineLimits::sven_coop(),
            hulls: HullSizes::half_life(),
            save: SaveOptions::default(),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "half-life" | "halflife" | "hl" => Some(Self::half_life()),
            "quake" | "q1" => Some(Self::quake()),
            "sven" | "sven-coop" | "svencoop" => Some(Self::sven_coop()),
            _ => None,
        }
    }

    /// Parse a TOML profile. `base` names a preset (default Half-Life); any
    /// other field present overrides that preset.
    ///
    /// ```toml
    /// base = "quake"
    /// [limits]
    /// max_clipnodes = 65520
    /// [save]
    /// preserve_wide_layout = false
    /// ```
    pub fn from_toml(text: &str) -> Result<Self, ProfileError> {
        let raw: RawProfile = toml::from_str(text)?;
        let mut profile = match raw.base {
            Some(name) => Self::by_name(&name).ok_or(ProfileError::UnknownBase(name))?,
            None => Self::default(),
        };
        raw.limits.apply(&mut profile.limits);
        if let Some(hulls) = raw.hulls {
            profile.hulls = hulls;
        }
        if let Some(save) = raw.save {
            if let Some(v) = save.preserve_wide_layout {
                profile.save.preserve_wide_layout = v;
            }
        }
        Ok(profile)
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    base: Option<String>,
    #[serde(default)]
    limits: LimitOverrides,
    hulls: Option<HullSizes>,
    save: Option<RawSave>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSave {
    preserve_wide_layout: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LimitOverrides {
    max_planes: Option<usize>,
    max_nodes: Option<usize>,
    max_clipnodes: Option<usize>,
    max_leaves: Option<usize>,
    max_faces: Option<usize>,
    max_edges: Option<usize>,
    max_surfedges: Option<usize>,
    max_marksurfaces: Option<usize>,
    max_vertices: Option<usize>,
    max_texinfos: Option<usize>,
    max_models: Option<usize>,
    max_textures: Option<usize>,
    max_lighting: Option<usize>,
    max_visdata: Option<usize>,
    max_entdata: Option<usize>,
    max_map_coord: Option<f32>,
}

impl LimitOverrides {
    fn apply(&self, l: &mut EngineLimits) {
        macro_rules! set {
            ($($f:ident),*) => {
                $(if let Some(v) = self.$f { l.$f = v; })*
            };
        }
        set!(
            max_planes, max_nodes, max_clipnodes, max_leaves, max_faces, max_edges,
            max_surfedges, max_marksurfaces, max_vertices, max_texinfos, max_models,
            max_textures, max_lighting, max_visdata, max_entdata, max_map_coord
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_half_life() {
        let p = EngineProfile::default();
        assert_eq!(p.limits, EngineLimits::half_life());
        assert_eq!(p.hulls.maxs[3], [16.0, 16.0, 18.0]);
        assert!(p.save.preserve_wide_layout);
    }

    #[test]
    fn toml_overrides_preset() {
        let p = EngineProfile::from_toml(
            r#"
            base = "quake"
            [limits]
            max_clipnodes = 65520
            [save]
            preserve_wide_layout = false
            "#,
        )
        .unwrap();
        assert_eq!(p.limits.max_clipnodes, 65520);
        assert_eq!(p.limits.max_models, EngineLimits::quake().max_models);
        assert_eq!(p.hulls, HullSizes::quake());
        assert!(!p.save.preserve_wide_layout);
    }

    #[test]
    fn toml_rejects_unknown_base_and_fields() {
        assert!(matches!(
            EngineProfile::from_toml("base = \"doom\""),
            Err(ProfileError::UnknownBase(_))
        ));
        assert!(matches!(
            EngineProfile::from_toml("[limits]\nmax_bananas = 3"),
            Err(ProfileError::Parse(_))
        ));
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(EngineProfile::from_toml("").unwrap(), EngineProfile::default());
    }
}
