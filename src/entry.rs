/*!
# Descriptor Records

Every recoverable asset is located by a 16-byte big-endian record, the
"data entry". The same layout appears embedded in the main executable, in
decompressed rel blobs, and is synthesized for gap-sweep findings.

## Record layout

```
Descriptor layout (16 bytes, big-endian bit stream):
1. reserved          (16 bits) - zero in every compressed fingerprint
2. repetition_bit    (8 bits)  - LZSS length field width
3. lookback_bit      (8 bits)  - LZSS distance field width
4. compression_flag  (4 bits)  - 4 = compressed, 0 = raw
5. original_size     (28 bits) - decompressed byte count
6. offset            (32 bits) - byte offset in the data archive
7. compressed_size   (32 bits) - on-disk byte count
```

Disk offsets are sector-aligned; the slack between the end of a payload
and the next sector boundary is the footer, derived rather than stored.
*/

use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deku::prelude::*;
use serde::{Deserialize, Serialize};

/// Physical disc sector; every descriptor's disk offset is a multiple.
pub const SECTOR_SIZE: u64 = 0x800;

/// Compression flag value of LZSS-compressed payloads.
pub const FLAG_COMPRESSED: u8 = 4;
/// Compression flag value of raw payloads.
pub const FLAG_RAW: u8 = 0;

/// The on-disk form of a descriptor record.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct RawDataEntry {
    #[deku(bits = 16)]
    reserved: u16,
    #[deku(bits = 8)]
    repetition_bit: u8,
    #[deku(bits = 8)]
    lookback_bit: u8,
    #[deku(bits = 4)]
    compression_flag: u8,
    #[deku(bits = 28)]
    original_size: u32,
    offset: u32,
    compressed_size: u32,
}

/// One discovered asset: the wire fields plus where the record was found
/// and what the extracted file should be called.
///
/// Equality and hashing cover the wire fields, the derived footer, and the
/// source container (`input`) - never `output_name`, which may be rewritten
/// from the sidecar name list. `equals_besides_filename` additionally drops
/// `input`, for deduplicating a record across scans of different blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "DataEntryJson", from = "DataEntryJson")]
pub struct DataEntry {
    /// Container the payload is read from (main, code, or data archive).
    pub input: PathBuf,
    pub output_name: String,
    pub lookback_bit: u8,
    pub repetition_bit: u8,
    pub compression_flag: u8,
    pub original_size: u32,
    pub offset: u32,
    pub compressed_size: u32,
}

impl DataEntry {
    /// Serialized record size in bytes.
    pub const SIZE: usize = 16;

    /// Parse the 16 bytes at `offset` in `data`.
    pub fn parse(data: &[u8], offset: usize, input: &Path) -> Result<Self> {
        let raw_bytes = data
            .get(offset..offset + Self::SIZE)
            .context("descriptor record extends past the end of the blob")?;
        let (_, raw) = RawDataEntry::from_bytes((raw_bytes, 0))
            .map_err(|e| anyhow::anyhow!("Failed to parse descriptor record: {e}"))?;

        let mut entry = Self {
            input: input.to_path_buf(),
            output_name: String::new(),
            lookback_bit: raw.lookback_bit,
            repetition_bit: raw.repetition_bit,
            compression_flag: raw.compression_flag,
            original_size: raw.original_size,
            offset: raw.offset,
            compressed_size: raw.compressed_size,
        };
        entry.reset_output_name();
        Ok(entry)
    }

    /// Serialize back to the 16-byte wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let raw = RawDataEntry {
            reserved: 0,
            repetition_bit: self.repetition_bit,
            lookback_bit: self.lookback_bit,
            compression_flag: self.compression_flag,
            original_size: self.original_size,
            offset: self.offset,
            compressed_size: self.compressed_size,
        };
        raw.to_bytes()
            .map_err(|e| anyhow::anyhow!("Failed to serialize descriptor record: {e}"))
    }

    /// The default output name: widths and disk offset, hex.
    pub fn default_output_name(lookback_bit: u8, repetition_bit: u8, offset: u32) -> String {
        format!("{lookback_bit:02x}{repetition_bit:02x} {offset:08x}.dat")
    }

    pub fn reset_output_name(&mut self) {
        self.output_name =
            Self::default_output_name(self.lookback_bit, self.repetition_bit, self.offset);
    }

    /// Slack between the payload end and the next sector boundary.
    pub fn footer_size(&self) -> u64 {
        let tail = (u64::from(self.offset) + u64::from(self.compressed_size)) % SECTOR_SIZE;
        if tail == 0 {
            0
        } else {
            SECTOR_SIZE - tail
        }
    }

    /// Half-open range of the data archive this entry occupies, footer
    /// included.
    pub fn to_range(&self) -> Range<u64> {
        let start = u64::from(self.offset);
        start..start + u64::from(self.compressed_size) + self.footer_size()
    }

    /// Field-level equality that ignores which container the record was
    /// found in. Used when migrating a record between finding sets.
    pub fn equals_besides_filename(&self, other: &Self) -> bool {
        self.lookback_bit == other.lookback_bit
            && self.repetition_bit == other.repetition_bit
            && self.compression_flag == other.compression_flag
            && self.original_size == other.original_size
            && self.offset == other.offset
            && self.compressed_size == other.compressed_size
            && self.footer_size() == other.footer_size()
    }
}

impl PartialEq for DataEntry {
    fn eq(&self, other: &Self) -> bool {
        self.equals_besides_filename(other) && self.input == other.input
    }
}

impl Eq for DataEntry {}

impl Hash for DataEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.input.hash(state);
        self.lookback_bit.hash(state);
        self.repetition_bit.hash(state);
        self.compression_flag.hash(state);
        self.original_size.hash(state);
        self.offset.hash(state);
        self.compressed_size.hash(state);
        self.footer_size().hash(state);
    }
}

/// The manifest's JSON shape for one entry. `footerSize` is written for
/// readers but recomputed from the other fields on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataEntryJson {
    #[serde(rename = "Input")]
    input: PathBuf,
    #[serde(rename = "Output")]
    output: String,
    lookback_bit: u8,
    repetition_bit: u8,
    original_size: u32,
    offset: u32,
    compressed_size: u32,
    compression_flag: u8,
    #[serde(rename = "footerSize", default)]
    footer_size: u64,
}

impl From<DataEntry> for DataEntryJson {
    fn from(entry: DataEntry) -> Self {
        let footer_size = entry.footer_size();
        Self {
            input: entry.input,
            output: entry.output_name,
            lookback_bit: entry.lookback_bit,
            repetition_bit: entry.repetition_bit,
            original_size: entry.original_size,
            offset: entry.offset,
            compressed_size: entry.compressed_size,
            compression_flag: entry.compression_flag,
            footer_size,
        }
    }
}

impl From<DataEntryJson> for DataEntry {
    fn from(json: DataEntryJson) -> Self {
        Self {
            input: json.input,
            output_name: json.output,
            lookback_bit: json.lookback_bit,
            repetition_bit: json.repetition_bit,
            compression_flag: json.compression_flag,
            original_size: json.original_size,
            offset: json.offset,
            compressed_size: json.compressed_size,
        }
    }
}
