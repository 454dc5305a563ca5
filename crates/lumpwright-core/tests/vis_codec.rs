use lumpwright_core::vis::{compress_row, decompress_row, row_bytes_used, row_size};
use proptest::prelude::*;

/// A leaf count and a row for it, zero past the used bytes. Zeros are
/// drawn often so runs get exercised.
fn row_strategy() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (1usize..1200).prop_flat_map(|leaf_count| {
        let used = row_bytes_used(leaf_count);
        (
            Just(leaf_count),
            prop::collection::vec(prop_oneof![3 => Just(0u8), 1 => any::<u8>()], used),
        )
    })
}

proptest! {
    #[test]
    fn decompress_inverts_compress((leaf_count, used_bytes) in row_strategy()) {
        let mut row = used_bytes.clone();
        row.resize(row_size(leaf_count), 0);

        let packed = compress_row(&row, leaf_count);
        prop_assert!(packed.len() <= 2 * used_bytes.len());

        let mut out = vec![0xAAu8; row_size(leaf_count)];
        decompress_row(&packed, 0, leaf_count, &mut out).unwrap();
        prop_assert_eq!(out, row);
    }

    #[test]
    fn rows_decode_at_any_offset(prefix in prop::collection::vec(any::<u8>(), 0..32), (leaf_count, used_bytes) in row_strategy()) {
        let mut src = prefix.clone();
        src.extend(compress_row(&used_bytes, leaf_count));

        let mut out = vec![0u8; row_size(leaf_count)];
        decompress_row(&src, prefix.len(), leaf_count, &mut out).unwrap();
        prop_assert_eq!(&out[..used_bytes.len()], &used_bytes[..]);
    }
}

#[test]
fn long_zero_runs_split_at_255() {
    let leaf_count = 8 * 600;
    let row = vec![0u8; row_size(leaf_count)];
    let packed = compress_row(&row, leaf_count);
    assert_eq!(packed, vec![0, 255, 0, 255, 0, 90]);
}
