//! Load, edit and save compiled Quake / Half-Life BSP levels.
//!
//! A [`Document`] owns every lump of one map in a single canonical layout.
//! Editing operations (`collect`, `split`, `edit`, `hull`) work on typed
//! records and keep cross-references consistent; saving picks the narrowest
//! on-disk layout that holds the result.

#![allow(clippy::needless_range_loop, clippy::manual_range_contains, clippy::float_cmp)]

pub mod bspfile;
pub mod checksum;
pub mod collect;
pub mod document;
pub mod edit;
pub mod entity;
pub mod error;
pub mod hull;
pub mod lightmap;
pub mod lump;
pub mod mathlib;
pub mod normalize;
pub mod profile;
pub mod progress;
pub mod remap;
pub mod split;
pub mod texture;
pub mod usage;
pub mod validate;
pub mod vis;

pub use collect::{collect, RemovedCounts};
pub use document::{Document, Table};
pub use error::{EditError, LoadError, LumpError, ProfileError, VisError};
pub use lump::{LumpId, LumpMask, LumpStore};
pub use normalize::{Capabilities, FormatInfo, SubFormat};
pub use profile::EngineProfile;
pub use validate::Finding;
