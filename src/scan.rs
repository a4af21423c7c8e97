/*!
# Fingerprint Scanner

The disc carries no central index of its assets; what it does carry is the
descriptor records themselves, embedded wherever code references an asset.
This module locates those records inside arbitrary blobs.

Three fingerprints are recognised:

1. **Compressed descriptors** - lead with two zero bytes and the codec
   widths, so each supported `(lookback, repetition)` pair has a fixed
   4-byte tag.
2. **Uncompressed descriptors** - lead with four zero bytes; the field
   constraints (flag, alignment, near-equal sizes) weed out random zeros.
3. **AdGCForm containers** - the 8-byte literal tag preceded by a
   little-endian size/parameter prefix, found in the data archive itself.

A fourth pass reclassifies descriptors whose payload actually lives in the
code archive (the rels) by probing every sector boundary for decodable
streams.
*/

use std::collections::HashSet;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::entry::{DataEntry, FLAG_COMPRESSED, FLAG_RAW, SECTOR_SIZE};
use crate::lzss;

/// Codec width pairs that appear on the discs.
pub const USABLE_COMPRESSIONS: [(u8, u8); 2] = [(11, 4), (0x0E, 5)];

const ADGC_TAG: &[u8] = b"AdGCForm";

/// A rel must decode to at least this much before its sector counts as a
/// compressed stream.
const MIN_REL_BYTES: usize = 200;

/// Raw descriptors may disagree between stored and on-disk size by a few
/// alignment bytes.
const SIZE_EPSILON: u32 = 3;

/// First occurrence of `pattern` in `data` at or after `from`.
fn find_pattern(data: &[u8], pattern: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(pattern.len())
        .position(|window| window == pattern)
        .map(|i| i + from)
}

fn sector_aligned(offset: u32) -> bool {
    u64::from(offset) % SECTOR_SIZE == 0
}

/// Scan `data` for compressed descriptors of every supported width pair.
pub fn search_all_compressions(data: &[u8], source: &Path) -> HashSet<DataEntry> {
    let mut found = HashSet::new();
    for (lookback, repetition) in USABLE_COMPRESSIONS {
        found.extend(search_compression(data, lookback, repetition, source));
    }
    found
}

/// Scan `data` for compressed descriptors with one specific width pair.
pub fn search_compression(
    data: &[u8],
    lookback: u8,
    repetition: u8,
    source: &Path,
) -> HashSet<DataEntry> {
    let tag = [0u8, 0, repetition, lookback];

    let mut found = HashSet::new();
    let mut begin = 0usize;
    while let Some(i) = find_pattern(data, &tag, begin) {
        if i + DataEntry::SIZE > data.len() {
            break;
        }
        if let Ok(entry) = DataEntry::parse(data, i, source) {
            if entry.compression_flag == FLAG_COMPRESSED
                && entry.offset != 0
                && sector_aligned(entry.offset)
            {
                found.insert(entry);
            }
        }
        // The tag is 4 bytes; nothing shorter can hide another hit.
        begin = i + tag.len();
    }
    found
}

/// Scan `data` for uncompressed descriptors.
pub fn search_uncompressed(data: &[u8], source: &Path) -> HashSet<DataEntry> {
    let tag = [0u8; 4];

    let mut found = HashSet::new();
    let mut begin = 0usize;
    while let Some(i) = find_pattern(data, &tag, begin) {
        if i + DataEntry::SIZE > data.len() {
            break;
        }
        if let Ok(entry) = DataEntry::parse(data, i, source) {
            if entry.compression_flag == FLAG_RAW
                && entry.offset != 0
                && sector_aligned(entry.offset)
                && entry.compressed_size > 0
                && entry.original_size > 0
                && entry.compressed_size.abs_diff(entry.original_size) <= SIZE_EPSILON
            {
                found.insert(entry);
            }
        }
        begin = i + 1;
    }
    found
}

/// Scan a blob (in practice the data archive) for AdGCForm containers.
///
/// The 8 bytes before the tag hold, little-endian, the decompressed size
/// with the compression flag in its top nibble, then the codec widths.
/// Compressed containers get their on-disk length by probing the stream
/// that follows the tag.
pub fn search_adgc(data: &[u8], source: &Path) -> HashSet<DataEntry> {
    let mut found = HashSet::new();
    let mut begin = 0usize;
    while let Some(i) = find_pattern(data, ADGC_TAG, begin) {
        if i + DataEntry::SIZE > data.len() {
            break;
        }
        if i >= 8 {
            let payload_start = i + ADGC_TAG.len();
            let prefix = &data[i - 8..i];
            let sized_flag = LittleEndian::read_u32(&prefix[..4]);
            let compression_info = LittleEndian::read_u32(&prefix[4..]);

            let compression_flag = (sized_flag >> 28) as u8;
            let original_size = sized_flag & 0x0FFF_FFFF;

            let (lookback_bit, repetition_bit, compressed_size) = if compression_flag == FLAG_RAW {
                (0, 0, original_size)
            } else {
                let lookback = (compression_info & 0xFF) as u8;
                let repetition = ((compression_info >> 8) & 0xFF) as u8;
                let probed = lzss::probe_compressed_size(
                    data,
                    payload_start,
                    original_size as usize,
                    u32::from(lookback),
                    u32::from(repetition),
                )
                .unwrap_or(0);
                (lookback, repetition, probed as u32)
            };

            found.insert(DataEntry {
                input: source.to_path_buf(),
                output_name: format!(
                    "AdGCForm {lookback_bit:02x}{repetition_bit:02x} {payload_start:08x}.dat"
                ),
                lookback_bit,
                repetition_bit,
                compression_flag,
                original_size,
                offset: payload_start as u32,
                compressed_size,
            });
        }
        begin = i + 1;
    }
    found
}

/// Reclassify descriptors whose payload lives in the code archive.
///
/// Every sector-aligned offset of the code archive that decodes with the
/// default widths is a rel candidate; descriptors pointing at such an
/// offset are re-validated against their declared size, moved out of
/// `found_compressed`, and re-homed onto the code archive.
pub fn extract_rels(
    code: &[u8],
    found_compressed: &mut HashSet<DataEntry>,
    code_path: &Path,
) -> HashSet<DataEntry> {
    let mut rels = HashSet::new();

    for offset in (0..code.len()).step_by(SECTOR_SIZE as usize) {
        if !lzss::test_decompress(
            code,
            offset,
            MIN_REL_BYTES,
            lzss::DEFAULT_LOOKBACK_BITS,
            lzss::DEFAULT_REPETITION_BITS,
        ) {
            continue;
        }

        let matches: Vec<DataEntry> = found_compressed
            .iter()
            .filter(|entry| entry.offset as usize == offset)
            .cloned()
            .collect();

        for entry in matches {
            // The candidate sector decodes; make sure it decodes for the
            // full declared size before claiming the descriptor.
            if lzss::test_decompress(
                code,
                entry.offset as usize,
                entry.original_size as usize,
                u32::from(entry.lookback_bit),
                u32::from(entry.repetition_bit),
            ) {
                found_compressed.remove(&entry);
                let mut rel = entry;
                rel.input = code_path.to_path_buf();
                rels.insert(rel);
            }
        }
    }

    rels
}
