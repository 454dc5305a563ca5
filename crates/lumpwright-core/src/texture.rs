// texture.rs -- the miptex directory held in the textures lump
//
// Layout: count:i32, count offsets (i32, -1 = missing), then one blob per
// texture starting with a 40-byte miptex header (name[16], width, height,
// four mip offsets). Blobs are kept opaque apart from the header.

use crate::bspfile::{put_i32, ByteReader, Overrun};

pub const MIPTEX_NAME_LEN: usize = 16;
pub const MIPTEX_HEADER_SIZE: usize = MIPTEX_NAME_LEN + 4 + 4 + 4 * 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureDirectory {
    /// One blob per slot; `None` for slots whose offset is -1.
    pub entries: Vec<Option<Vec<u8>>>,
}

impl TextureDirectory {
    /// Parse a textures lump. An empty lump is an empty directory.
    pub fn parse(bytes: &[u8]) -> Result<Self, Overrun> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut r = ByteReader::new(bytes);
        let count = r.i32()?.max(0) as usize;
        let mut offsets = Vec::with_capacity(count.min(bytes.len() / 4));
        for _ in 0..count {
            offsets.push(r.i32()?);
        }

        // each blob runs to the next larger offset (or the lump end)
        let mut starts: Vec<usize> = offsets
            .iter()
            .filter(|&&o| o >= 0)
            .map(|&o| o as usize)
            .collect();
        starts.sort_unstable();
        starts.dedup();

        let mut entries = Vec::with_capacity(count);
        for &ofs in &offsets {
            if ofs < 0 {
                entries.push(None);
                continue;
            }
            let start = ofs as usize;
            if start > bytes.len() {
                return Err(Overrun {
                    at: start,
                    wanted: 0,
                    len: bytes.len(),
                });
            }
            let end = starts
                .iter()
                .find(|&&s| s > start)
                .map_or(bytes.len(), |&s| s.min(bytes.len()));
            entries.push(Some(bytes[start..end].to_vec()));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = 4 + 4 * self.entries.len();
        let mut out = Vec::with_capacity(
            header + self.entries.iter().flatten().map(|b| b.len() + 3).sum::<usize>(),
        );
        put_i32(&mut out, self.entries.len() as i32);
        out.resize(header, 0);

        let mut offsets = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entry {
                Some(blob) => {
                    offsets.push(out.len() as i32);
                    out.extend_from_slice(blob);
                    while out.len() % 4 != 0 {
                        out.push(0);
                    }
                }
                None => offsets.push(-1),
            }
        }
        for (i, ofs) in offsets.iter().enumerate() {
            out[4 + i * 4..8 + i * 4].copy_from_slice(&ofs.to_le_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Texture name from the miptex header, NUL-trimmed.
    pub fn name(&self, index: usize) -> Option<String> {
        let blob = self.entries.get(index)?.as_ref()?;
        let raw = blob.get(..MIPTEX_NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(MIPTEX_NAME_LEN);
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn size(&self, index: usize) -> Option<[u32; 2]> {
        let blob = self.entries.get(index)?.as_ref()?;
        let mut r = ByteReader::at(blob, MIPTEX_NAME_LEN);
        Some([r.u32().ok()?, r.u32().ok()?])
    }

    /// Keep only slots with `keep[i]` set, in order. Returns old -> new.
    pub fn retain(&mut self, keep: &[bool]) -> Vec<Option<usize>> {
        let mut map = Vec::with_capacity(self.entries.len());
        let mut kept = Vec::new();
        for (i, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if keep.get(i).copied().unwrap_or(false) {
                map.push(Some(kept.len()));
                kept.push(entry);
            } else {
                map.push(None);
            }
        }
        self.entries = kept;
        map
    }
}
