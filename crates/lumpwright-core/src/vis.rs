// vis.rs -- leaf visibility rows: run-length codec and leaf-count changes
//
// Row for leaf L (L >= 1) is a bitset over vis leaves: bit j means leaf j+1
// is potentially visible. Leaf 0 never has a row. Compressed rows are a
// byte stream where a non-zero byte is a literal and a zero byte is followed
// by a count of zero bytes.

use std::collections::HashMap;

use crate::bspfile::Leaf;
use crate::document::Document;
use crate::error::VisError;
use crate::lump::LumpId;

/// Decompressed row width for `leaf_count` vis leaves, rounded up to 64 bits.
#[inline]
pub fn row_size(leaf_count: usize) -> usize {
    ((leaf_count + 63) & !63) >> 3
}

/// Bytes of a row that actually carry leaf bits.
#[inline]
pub fn row_bytes_used(leaf_count: usize) -> usize {
    (leaf_count + 7) >> 3
}

#[inline]
pub fn bit(row: &[u8], leaf: usize) -> bool {
    row.get(leaf >> 3).is_some_and(|b| b & (1 << (leaf & 7)) != 0)
}

#[inline]
pub fn set_bit(row: &mut [u8], leaf: usize, on: bool) {
    if let Some(b) = row.get_mut(leaf >> 3) {
        if on {
            *b |= 1 << (leaf & 7);
        } else {
            *b &= !(1 << (leaf & 7));
        }
    }
}

/// Decompress the row starting at `offset` into `out`, which must hold at
/// least `row_bytes_used(leaf_count)` bytes. Stops once those bytes are
/// filled.
pub fn decompress_row(
    src: &[u8],
    offset: usize,
    leaf_count: usize,
    out: &mut [u8],
) -> Result<(), VisError> {
    let used = row_bytes_used(leaf_count);
    if out.len() < used {
        return Err(VisError::RowOverrun {
            offset,
            row_size: out.len(),
        });
    }
    out.fill(0);

    let mut inp = offset;
    let mut out_p = 0;
    while out_p < used {
        let Some(&b) = src.get(inp) else {
            return Err(VisError::SourceOverrun { offset });
        };
        if b != 0 {
            out[out_p] = b;
            out_p += 1;
            inp += 1;
            continue;
        }

        let Some(&count) = src.get(inp + 1) else {
            return Err(VisError::SourceOverrun { offset });
        };
        inp += 2;
        let count = count as usize;
        if out_p + count > out.len() {
            return Err(VisError::RowOverrun {
                offset,
                row_size: out.len(),
            });
        }
        // zeros already in place
        out_p += count;
    }
    Ok(())
}

/// Compress the leaf-carrying bytes of one row.
pub fn compress_row(row: &[u8], leaf_count: usize) -> Vec<u8> {
    let used = row_bytes_used(leaf_count).min(row.len());
    let mut out = Vec::with_capacity(used);
    let mut i = 0;
    while i < used {
        let b = row[i];
        out.push(b);
        i += 1;
        if b != 0 {
            continue;
        }
        let mut rep = 1u8;
        while i < used && row[i] == 0 && rep < u8::MAX {
            rep += 1;
            i += 1;
        }
        out.push(rep);
    }
    out
}

// ============================================================
// Whole-document rows
// ============================================================

/// Every leaf's decompressed row. Index 0 is leaf 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisRows {
    leaf_count: usize,
    /// `None` for leaves without visibility data.
    rows: Vec<Option<Vec<u8>>>,
}

impl VisRows {
    /// `leaf_count` leaves, none of which has a row.
    pub fn new(leaf_count: usize) -> Self {
        Self {
            leaf_count,
            rows: vec![None; leaf_count],
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn row(&self, vis_leaf: usize) -> Option<&[u8]> {
        self.rows.get(vis_leaf)?.as_deref()
    }

    pub fn set_row(&mut self, vis_leaf: usize, row: Option<Vec<u8>>) {
        let size = row_size(self.leaf_count);
        if let Some(slot) = self.rows.get_mut(vis_leaf) {
            *slot = row.map(|mut r| {
                r.resize(size, 0);
                clear_tail(&mut r, self.leaf_count);
                r
            });
        }
    }

    pub fn can_see(&self, from: usize, to: usize) -> bool {
        self.row(from).is_some_and(|r| bit(r, to))
    }

    /// Pad or truncate every row to a new leaf count. New leaves get no row.
    pub fn resize(&mut self, leaf_count: usize) {
        let size = row_size(leaf_count);
        for row in self.rows.iter_mut().flatten() {
            row.resize(size, 0);
            clear_tail(row, leaf_count);
        }
        self.rows.resize(leaf_count, None);
        self.leaf_count = leaf_count;
    }

    /// Drop the rows of removed leaves and delete their bits from every
    /// remaining row. `removed[i]` refers to vis leaf `i`.
    pub fn remove_leaves(&mut self, removed: &[bool]) {
        let is_removed = |i: usize| removed.get(i).copied().unwrap_or(false);
        let kept: Vec<usize> = (0..self.leaf_count).filter(|&i| !is_removed(i)).collect();
        let new_count = kept.len();
        let size = row_size(new_count);

        let rows = std::mem::take(&mut self.rows);
        self.rows = rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !is_removed(*i))
            .map(|(_, row)| {
                row.map(|old| {
                    let mut new = vec![0u8; size];
                    for (new_bit, &old_bit) in kept.iter().enumerate() {
                        set_bit(&mut new, new_bit, bit(&old, old_bit));
                    }
                    new
                })
            })
            .collect();
        self.leaf_count = new_count;
    }

    /// Append one new leaf per entry of `sources`, each a copy of that vis
    /// leaf: same row, and visible from everywhere the source is visible.
    pub fn duplicate_leaves(&mut self, sources: &[usize]) {
        let old_count = self.leaf_count;
        self.resize(old_count + sources.len());

        for row in self.rows.iter_mut().flatten() {
            for (k, &src) in sources.iter().enumerate() {
                let visible = bit(row, src);
                set_bit(row, old_count + k, visible);
            }
        }
        for (k, &src) in sources.iter().enumerate() {
            let copy = self.rows.get(src).cloned().flatten();
            self.rows[old_count + k] = copy;
        }
    }
}

fn clear_tail(row: &mut [u8], leaf_count: usize) {
    for i in leaf_count..row.len() * 8 {
        set_bit(row, i, false);
    }
}

/// Decompress every leaf's row, reading rows `leaf_count` bits wide.
/// Rows that fail to decompress are logged and treated as absent.
pub fn decompress_all_with(doc: &Document, leaf_count: usize) -> VisRows {
    let vis = doc.lumps().get(LumpId::Visibility);
    let leaves = doc.table::<Leaf>();
    let mut rows = VisRows::new(leaf_count);
    let size = row_size(leaf_count);

    for (i, slot) in rows.rows.iter_mut().enumerate() {
        let Some(leaf) = leaves.get(i + 1) else {
            break;
        };
        if leaf.vis_offset < 0 {
            continue;
        }
        let mut row = vec![0u8; size];
        match decompress_row(vis, leaf.vis_offset as usize, leaf_count, &mut row) {
            Ok(()) => *slot = Some(row),
            Err(e) => tracing::warn!(leaf = i + 1, error = %e, "vis decompression aborted"),
        }
    }
    rows
}

/// Decompress every row at the document's current leaf count.
pub fn decompress_all(doc: &Document) -> VisRows {
    decompress_all_with(doc, doc.vis_leaf_count())
}

/// Compress `rows` into a new visibility lump and point every leaf at its
/// row. Identical rows share one compressed copy.
pub fn recompress_all(doc: &mut Document, rows: &VisRows) {
    let progress = doc.progress();
    progress.start("recompress vis", rows.leaf_count);

    let mut leaves = doc.records::<Leaf>();
    if leaves.len().saturating_sub(1) != rows.leaf_count {
        tracing::warn!(
            leaves = leaves.len(),
            rows = rows.leaf_count,
            "vis row count does not match the leaf table"
        );
    }

    let mut lump = Vec::new();
    let mut seen: HashMap<&[u8], i32> = HashMap::new();
    let used = row_bytes_used(rows.leaf_count);
    let mut shared = 0usize;

    for (i, row) in rows.rows.iter().enumerate() {
        progress.tick();
        let Some(leaf) = leaves.get_mut(i + 1) else {
            break;
        };
        let Some(row) = row else {
            leaf.vis_offset = -1;
            continue;
        };
        let key = &row[..used.min(row.len())];
        if let Some(&ofs) = seen.get(key) {
            leaf.vis_offset = ofs;
            shared += 1;
            continue;
        }
        let ofs = lump.len() as i32;
        lump.extend(compress_row(row, rows.leaf_count));
        seen.insert(key, ofs);
        leaf.vis_offset = ofs;
    }
    // leaves past the rows have nothing to point at
    for leaf in leaves.iter_mut().skip(rows.rows.len() + 1) {
        leaf.vis_offset = -1;
    }

    tracing::debug!(bytes = lump.len(), shared, "recompressed visibility");
    doc.lumps_mut().put_blob(LumpId::Visibility, lump);
    doc.set_records(&leaves);
    progress.finish();
}

/// Re-encode visibility after the leaf count changed from `old_leaf_count`
/// vis leaves to the document's current count. Rows are read at the old
/// width, padded or truncated, then written at the new width.
pub fn resize_rows(doc: &mut Document, old_leaf_count: usize) {
    let mut rows = decompress_all_with(doc, old_leaf_count);
    rows.resize(doc.vis_leaf_count());
    recompress_all(doc, &rows);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::SubFormat;

    #[test]
    fn row_sizes_are_64_bit_aligned() {
        assert_eq!(row_size(0), 0);
        assert_eq!(row_size(1), 8);
        assert_eq!(row_size(64), 8);
        assert_eq!(row_size(65), 16);
        assert_eq!(row_bytes_used(9), 2);
    }

    #[test]
    fn compress_known_row() {
        let row = [0x01, 0x00, 0x00, 0x00, 0x80, 0, 0, 0];
        let c = compress_row(&row, 40);
        assert_eq!(c, vec![0x01, 0x00, 0x03, 0x80]);
        let mut out = [0xAAu8; 8];
        decompress_row(&c, 0, 40, &mut out).unwrap();
        assert_eq!(out, row);
    }

    #[test]
    fn long_zero_runs_split_at_255() {
        let n = 300 * 8;
        let row = vec![0u8; row_size(n)];
        let c = compress_row(&row, n);
        assert_eq!(c, vec![0, 255, 0, 45]);
        let mut out = vec![1u8; row_size(n)];
        decompress_row(&c, 0, n, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn overruns_are_errors() {
        let mut out = [0u8; 8];
        assert_eq!(
            decompress_row(&[0x01], 0, 16, &mut out),
            Err(VisError::SourceOverrun { offset: 0 })
        );
        assert!(matches!(
            decompress_row(&[0x00, 200], 0, 16, &mut out),
            Err(VisError::RowOverrun { .. })
        ));
    }

    #[test]
    fn remove_leaves_shifts_bits() {
        let mut rows = VisRows::new(4);
        rows.set_row(0, Some(vec![0b1011]));
        rows.set_row(3, Some(vec![0b1000]));
        rows.remove_leaves(&[false, true, false, false]);

        assert_eq!(rows.leaf_count(), 3);
        // old leaves 0, 2, 3 -> new 0, 1, 2
        assert!(rows.can_see(0, 0));
        assert!(!rows.can_see(0, 1));
        assert!(rows.can_see(0, 2));
        assert!(rows.row(1).is_none());
        assert!(rows.can_see(2, 2));
        assert_eq!(rows.row(0).unwrap().len(), 8);
    }

    #[test]
    fn duplicated_leaf_copies_row_and_visibility() {
        let mut rows = VisRows::new(3);
        rows.set_row(0, Some(vec![0b011]));
        rows.set_row(1, Some(vec![0b111]));
        rows.set_row(2, Some(vec![0b110]));
        rows.duplicate_leaves(&[1]);

        assert_eq!(rows.leaf_count(), 4);
        assert!(rows.can_see(0, 3));
        assert!(rows.can_see(2, 3));
        assert_eq!(rows.row(3).unwrap()[0], 0b1111);
    }

    #[test]
    fn resize_truncates_bits_past_the_new_count() {
        let mut rows = VisRows::new(10);
        rows.set_row(0, Some(vec![0xFF, 0x03]));
        rows.resize(4);
        assert_eq!(rows.row(0).unwrap(), &[0x0F, 0, 0, 0, 0, 0, 0, 0]);
        rows.resize(70);
        assert_eq!(rows.row(0).unwrap().len(), 16);
        assert!(rows.row(5).is_none());
    }

    fn doc_with_leaves(n: usize) -> Document {
        let mut doc = Document::new_empty(SubFormat::HalfLife);
        let extra = vec![Leaf::default(); n];
        doc.push_records(&extra);
        doc
    }

    #[test]
    fn recompress_shares_identical_rows_and_keeps_missing() {
        let mut doc = doc_with_leaves(3);
        let mut rows = VisRows::new(3);
        rows.set_row(0, Some(vec![0b101]));
        rows.set_row(1, None);
        rows.set_row(2, Some(vec![0b101]));
        recompress_all(&mut doc, &rows);

        let leaves = doc.records::<Leaf>();
        assert_eq!(leaves[0].vis_offset, -1);
        assert_eq!(leaves[1].vis_offset, 0);
        assert_eq!(leaves[2].vis_offset, -1);
        assert_eq!(leaves[3].vis_offset, 0);
        assert_eq!(doc.lumps().get(LumpId::Visibility), &[0b101]);

        assert_eq!(decompress_all(&doc), rows);
    }

    #[test]
    fn resize_rows_reads_old_width() {
        // 9 vis leaves -> 2 used bytes per row
        let mut doc = doc_with_leaves(9);
        let mut rows = VisRows::new(9);
        for i in 0..9 {
            rows.set_row(i, Some(vec![0xFF, 0x01]));
        }
        recompress_all(&mut doc, &rows);

        let mut leaves = doc.records::<Leaf>();
        leaves.truncate(1 + 5);
        doc.set_records(&leaves);
        resize_rows(&mut doc, 9);

        let after = decompress_all(&doc);
        assert_eq!(after.leaf_count(), 5);
        assert_eq!(after.row(4).unwrap()[0], 0x1F);
        assert_eq!(doc.lumps().get(LumpId::Visibility), &[0x1F]);
    }
}
