// checksum.rs -- map checksums the engine compares between client and server
//
// Each lump's MD4 digest is folded into 32 bits by XORing its four words;
// the map checksum is the XOR of those over the serialized file's lumps.

use md4::{Digest, Md4};

use crate::bspfile::{ByteReader, HEADER_SIZE};
use crate::document::Document;
use crate::error::LoadError;
use crate::lump::LumpId;
use crate::normalize::lump_range;

/// MD4 of `data` folded to 32 bits.
pub fn block_checksum(data: &[u8]) -> u32 {
    let digest = Md4::digest(data);
    digest
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0, |acc, w| acc ^ w)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapChecksums {
    /// Every lump but the entities.
    pub checksum: u32,
    /// Also leaves out visibility, leaves and nodes, so it survives a re-vis.
    pub checksum2: u32,
}

/// Checksums of a serialized BSP file.
pub fn map_checksums(file: &[u8]) -> Result<MapChecksums, LoadError> {
    if file.len() < HEADER_SIZE {
        return Err(LoadError::TruncatedHeader { len: file.len() });
    }
    let mut r = ByteReader::at(file, 4);
    let mut sums = MapChecksums {
        checksum: 0,
        checksum2: 0,
    };
    for id in LumpId::ALL {
        let offset = r.i32()?;
        let len = r.i32()?;
        if id == LumpId::Entities {
            continue;
        }
        let sum = block_checksum(&file[lump_range(file, id.name(), offset, len)?]);
        sums.checksum ^= sum;
        if !matches!(id, LumpId::Visibility | LumpId::Leaves | LumpId::Nodes) {
            sums.checksum2 ^= sum;
        }
    }
    Ok(sums)
}

/// Checksums of the file `doc` would write now.
pub fn document_checksums(doc: &Document) -> Result<MapChecksums, LoadError> {
    map_checksums(&doc.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspfile::{Leaf, CONTENTS_EMPTY};
    use crate::entity::Entity;
    use crate::normalize::SubFormat;

    #[test]
    fn block_checksum_of_empty_input() {
        // MD4("") = 31d6cfe0 d16ae931 b73c59d7 e0c089c0
        let words = [0xe0cfd631u32, 0x31e96ad1, 0xd7593cb7, 0xc089c0e0];
        assert_eq!(block_checksum(&[]), words.iter().fold(0, |a, w| a ^ w));
    }

    #[test]
    fn entities_do_not_count() {
        let mut doc = Document::new_empty(SubFormat::HalfLife);
        let before = document_checksums(&doc).unwrap();
        let mut ents = doc.entities();
        ents.push(Entity::with_classname("info_player_start"));
        doc.set_entities(&ents);
        assert_eq!(document_checksums(&doc).unwrap(), before);
    }

    #[test]
    fn checksum2_ignores_leaves() {
        let mut doc = Document::new_empty(SubFormat::HalfLife);
        let before = document_checksums(&doc).unwrap();
        doc.push_record(Leaf { contents: CONTENTS_EMPTY, ..Leaf::default() });
        let after = document_checksums(&doc).unwrap();
        assert_ne!(after.checksum, before.checksum);
        assert_eq!(after.checksum2, before.checksum2);
    }

    #[test]
    fn short_file_is_rejected() {
        assert!(matches!(
            map_checksums(&[0u8; 12]),
            Err(LoadError::TruncatedHeader { len: 12 })
        ));
    }
}
