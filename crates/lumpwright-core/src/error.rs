//! Error types for loading, storing and editing BSP documents.

use thiserror::Error;

use crate::bspfile::Overrun;

/// Why a file could not become a `Document`. A failed load never exposes a
/// partially built document.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file too short for a BSP header ({len} bytes)")]
    TruncatedHeader { len: usize },

    #[error("unknown BSP version/tag {0:#010x}")]
    BadVersion(i32),

    #[error("lump {lump} (offset {offset}, length {len}) runs past end of file ({file_len} bytes)")]
    LumpOutOfRange {
        lump: &'static str,
        offset: i64,
        len: i64,
        file_len: usize,
    },

    #[error("lump {lump} has funny size {len} (record size {record_size})")]
    FunnyLumpSize {
        lump: &'static str,
        len: usize,
        record_size: usize,
    },

    #[error("read overrun at byte {} (wanted {}, have {})", .0.at, .0.wanted, .0.len)]
    Overrun(Overrun),

    #[error("extension header lump {index} is out of range")]
    ExtraLumpOutOfRange { index: usize },
}

impl From<Overrun> for LoadError {
    fn from(o: Overrun) -> Self {
        LoadError::Overrun(o)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LumpError {
    #[error("lump {lump}: {len} bytes is not a whole number of {record_size}-byte records")]
    Misaligned {
        lump: &'static str,
        len: usize,
        record_size: usize,
    },
}

/// A visibility row that could not be decompressed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisError {
    #[error("vis row at offset {offset} runs past the end of the visibility lump")]
    SourceOverrun { offset: usize },

    #[error("vis row at offset {offset} decompresses past {row_size} bytes")]
    RowOverrun { offset: usize, row_size: usize },
}

/// Rejected geometry edits. The document is unchanged when one of these is
/// returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("model {index} does not exist ({count} models)")]
    BadModel { index: usize, count: usize },

    #[error("hull {0} does not exist")]
    BadHull(usize),

    #[error("the world model can't be {0}")]
    WorldModel(&'static str),

    #[error("hull {0} can't be redirected to itself")]
    SelfRedirect(usize),

    #[error("move would put model {model} outside +/-{limit} units")]
    OutOfBounds { model: usize, limit: f32 },

    #[error(transparent)]
    Lump(#[from] LumpError),
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("engine profile parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown base profile {0:?}")]
    UnknownBase(String),
}
