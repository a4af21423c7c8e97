/*!
# Recovery Driver

Ties the scanner, the codec, and the range set together into the
per-version recovery run:

1. Fingerprint the main executable for compressed and raw descriptors.
2. Reclassify descriptors whose payload decodes out of the code archive
   (the rels), then decompress each rel and fingerprint it too.
3. Scan the data archive for AdGCForm containers.
4. Mark every known descriptor's occupancy range, then sweep the
   uncovered sectors of the data archive from the top down for payloads
   nothing references.
5. Extract everything to disk and write the `FoundFiles.json` manifest.

Descriptors whose payload turns out to be undecodable are dropped from
their set rather than failing the run; only missing inputs and
cancellation abort a version.
*/

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::common::{
    ensure_dir, load_known_files, CancelFlag, FileCache, InvalidInputs, ScanLog, VersionPaths,
    ADGC_OUTPUT, RAW_OUTPUT, REFERENCED_OUTPUT, REL_OUTPUT, UNREFERENCED_OUTPUT,
};
use crate::entry::{DataEntry, FLAG_COMPRESSED, FLAG_RAW, SECTOR_SIZE};
use crate::lzss;
use crate::ranges::RangeSet;
use crate::scan;

/// Gap-sweep candidates must decode to at least this much output before a
/// sector counts as a lost compressed payload; shorter matches are noise.
const MIN_SWEEP_BYTES: usize = 0x200;

/// The per-version result manifest: five disjoint descriptor sets, each
/// sorted by disk offset.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FoundFiles {
    #[serde(rename = "Rels")]
    pub rels: Vec<DataEntry>,
    #[serde(rename = "Raw files")]
    pub raw: Vec<DataEntry>,
    #[serde(rename = "Referenced files")]
    pub referenced: Vec<DataEntry>,
    #[serde(rename = "AdGCForms")]
    pub adgc: Vec<DataEntry>,
    #[serde(rename = "Unreferenced files")]
    pub unreferenced: Vec<DataEntry>,
}

/// Run the whole recovery pipeline for one version.
///
/// On success the manifest has been written and every extractable payload
/// is on disk. Cancellation and missing inputs surface as errors; a
/// cancelled run leaves partial payloads but no manifest.
pub fn recover_version(
    paths: &VersionPaths,
    cache: &FileCache,
    log: &dyn ScanLog,
    cancel: &CancelFlag,
) -> Result<FoundFiles> {
    log.message(&format!("Checking {} version...", paths.version));
    if !paths.valid() {
        return Err(InvalidInputs(paths.version).into());
    }

    ensure_dir(&paths.output_folder)?;

    let main_bytes = cache.bytes(&paths.main_path)?;
    let code_bytes = cache.bytes(&paths.code_path)?;
    let data_bytes = cache.bytes(&paths.data_path)?;

    let known_files = load_known_files(&paths.known_files_path)?;

    let mut found_compressed: HashSet<DataEntry> = HashSet::new();
    let mut found_uncompressed: HashSet<DataEntry> = HashSet::new();

    // All fingerprints, wherever they were found, locate payloads in the
    // data archive; rels get re-homed onto the code archive afterwards.
    scan_for_fingerprints(
        &main_bytes,
        &paths.data_path,
        log,
        &mut found_compressed,
        &mut found_uncompressed,
    );
    cancel.check()?;

    let found_rels = scan::extract_rels(&code_bytes, &mut found_compressed, &paths.code_path);
    log.message(&format!("Found rels {}", found_rels.len()));

    let found_adgc = scan::search_adgc(&data_bytes, &paths.data_path);
    log.message(&format!("AdGC {}", found_adgc.len()));
    cancel.check()?;

    for rel in &found_rels {
        log.message(&format!("{:08x}", rel.offset));
        let rel_blob = lzss::decompress(
            &code_bytes,
            rel.offset as usize,
            rel.original_size as usize,
            u32::from(rel.lookback_bit),
            u32::from(rel.repetition_bit),
        )
        .with_context(|| format!("Failed to decompress rel at {:08x}", rel.offset))?;
        scan_for_fingerprints(
            &rel_blob,
            &paths.data_path,
            log,
            &mut found_compressed,
            &mut found_uncompressed,
        );
        cancel.check()?;
    }

    let mut claimed = RangeSet::new();
    for entry in found_compressed
        .iter()
        .chain(&found_uncompressed)
        .chain(&found_adgc)
    {
        claimed.add(entry.to_range());
    }

    log.message("looking for unreferenced files... (could take a minute)");
    let found_unreferenced = sweep_unreferenced(&claimed, &data_bytes, paths);
    log.message(&format!("unreferenced {}", found_unreferenced.len()));
    cancel.check()?;

    log.message("Validating all compressions");
    let referenced = extract_collection(
        found_compressed,
        REFERENCED_OUTPUT,
        paths,
        cache,
        &known_files,
        log,
        cancel,
    )?;
    let raw = extract_collection(
        found_uncompressed,
        RAW_OUTPUT,
        paths,
        cache,
        &known_files,
        log,
        cancel,
    )?;
    let rels = extract_collection(
        found_rels,
        REL_OUTPUT,
        paths,
        cache,
        &known_files,
        log,
        cancel,
    )?;
    let adgc = extract_collection(
        found_adgc,
        ADGC_OUTPUT,
        paths,
        cache,
        &known_files,
        log,
        cancel,
    )?;
    let unreferenced = extract_collection(
        found_unreferenced,
        UNREFERENCED_OUTPUT,
        paths,
        cache,
        &known_files,
        log,
        cancel,
    )?;

    let manifest = FoundFiles {
        rels,
        raw,
        referenced,
        adgc,
        unreferenced,
    };
    write_manifest(paths, &manifest)?;

    Ok(manifest)
}

/// Fingerprint one blob for compressed and raw descriptors, accumulating
/// into the run's sets.
fn scan_for_fingerprints(
    blob: &[u8],
    data_path: &Path,
    log: &dyn ScanLog,
    compressed: &mut HashSet<DataEntry>,
    uncompressed: &mut HashSet<DataEntry>,
) {
    let found = scan::search_all_compressions(blob, data_path);
    if !found.is_empty() {
        log.message(&format!("found fingerprints {}", found.len()));
    }
    compressed.extend(found);

    let found = scan::search_uncompressed(blob, data_path);
    log.message(&format!("found uncompressed {}", found.len()));
    uncompressed.extend(found);
}

fn raw_gap_entry(paths: &VersionPaths, start: usize, end: usize) -> DataEntry {
    let size = (end - start) as u32;
    let mut entry = DataEntry {
        input: paths.data_path.clone(),
        output_name: String::new(),
        lookback_bit: 0,
        repetition_bit: 0,
        compression_flag: FLAG_RAW,
        original_size: size,
        offset: start as u32,
        compressed_size: size,
    };
    entry.reset_output_name();
    entry
}

fn compressed_gap_entry(
    paths: &VersionPaths,
    start: usize,
    end: usize,
    original_size: usize,
) -> DataEntry {
    let mut entry = DataEntry {
        input: paths.data_path.clone(),
        output_name: String::new(),
        lookback_bit: lzss::DEFAULT_LOOKBACK_BITS as u8,
        repetition_bit: lzss::DEFAULT_REPETITION_BITS as u8,
        compression_flag: FLAG_COMPRESSED,
        original_size: original_size as u32,
        offset: start as u32,
        compressed_size: (end - start) as u32,
    };
    entry.reset_output_name();
    entry
}

/// Walk the data archive downward one sector at a time and synthesize
/// descriptors for regions no known descriptor claims.
///
/// `upper_segment_start` tracks the bottom of the known-good region above
/// the walk pointer. Crossing into a claimed range emits the gap above as
/// a raw descriptor; a gap sector that decodes as LZSS emits a compressed
/// descriptor reaching up to `upper_segment_start`. The just-wrote flag
/// keeps a zero-length raw region from following a compressed emission at
/// the same boundary.
///
/// Sizes on these descriptors are best-effort by construction: the
/// decompressed size probe may overrun into unrelated bytes, and the
/// compressed size is the gap width, never validated.
fn sweep_unreferenced(
    claimed: &RangeSet,
    data: &[u8],
    paths: &VersionPaths,
) -> HashSet<DataEntry> {
    let sector = SECTOR_SIZE as usize;

    let mut out = HashSet::new();
    if data.is_empty() {
        return out;
    }

    let mut upper_segment_start = data.len();
    let mut prev_p = data.len();
    let mut p = data.len() - data.len() % sector;
    let mut just_wrote = false;

    loop {
        let mut wrote_this_step = false;

        if claimed.contains(p as u64) {
            let been_in_range_a_while = prev_p == upper_segment_start;
            if !been_in_range_a_while && !just_wrote {
                // Just crossed into a claimed range; the bytes above it up
                // to the known-good region are a lost raw segment.
                out.insert(raw_gap_entry(paths, prev_p, upper_segment_start));
                wrote_this_step = true;
            }
            upper_segment_start = p;
        }

        let in_range_now = p == upper_segment_start;
        if !in_range_now
            && lzss::test_decompress(
                data,
                p,
                MIN_SWEEP_BYTES,
                lzss::DEFAULT_LOOKBACK_BITS,
                lzss::DEFAULT_REPETITION_BITS,
            )
        {
            let original_size = lzss::probe_decompressed_size(
                data,
                p,
                upper_segment_start - p,
                lzss::DEFAULT_LOOKBACK_BITS,
                lzss::DEFAULT_REPETITION_BITS,
            );
            out.insert(compressed_gap_entry(
                paths,
                p,
                upper_segment_start,
                original_size,
            ));
            upper_segment_start = p;
            wrote_this_step = true;
        }

        just_wrote = wrote_this_step;
        prev_p = p;
        if p == 0 {
            break;
        }
        p -= sector;
    }

    out
}

/// Extract one category to disk and return its surviving entries sorted by
/// disk offset. Entries whose compressed payload fails to decode are
/// dropped; zero-size entries stay in the manifest but write nothing.
fn extract_collection(
    entries: HashSet<DataEntry>,
    category: &str,
    paths: &VersionPaths,
    cache: &FileCache,
    known_files: &HashMap<u32, String>,
    log: &dyn ScanLog,
    cancel: &CancelFlag,
) -> Result<Vec<DataEntry>> {
    let mut entries: Vec<DataEntry> = entries.into_iter().collect();
    entries.sort_by_key(|entry| entry.offset);

    // Sidecar names apply to payloads that live in the data archive; rels
    // keep their generated names.
    for entry in &mut entries {
        if entry.original_size > 0 && entry.input != paths.code_path {
            if let Some(name) = known_files.get(&entry.offset) {
                entry.output_name = name.clone();
            }
        }
    }

    let folder = paths.category_folder(category);
    log.message(&format!("Extracting {} files", folder.display()));

    let total = entries.len();
    let completed = AtomicUsize::new(0);

    let keep: Vec<bool> = entries
        .par_iter()
        .map(|entry| -> Result<bool> {
            cancel.check()?;
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            log.progress(done, total);
            write_payload(entry, &folder, cache)
        })
        .collect::<Result<Vec<bool>>>()?;

    Ok(entries
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect())
}

/// Write one entry's payload. `Ok(false)` means the entry's compressed
/// stream was undecodable and the entry should be dropped from its set.
fn write_payload(entry: &DataEntry, folder: &Path, cache: &FileCache) -> Result<bool> {
    if entry.original_size == 0 {
        return Ok(true);
    }

    let source = cache.bytes(&entry.input)?;
    let payload = if entry.compression_flag == FLAG_COMPRESSED {
        match lzss::decompress(
            &source,
            entry.offset as usize,
            entry.original_size as usize,
            u32::from(entry.lookback_bit),
            u32::from(entry.repetition_bit),
        ) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        }
    } else {
        let start = (entry.offset as usize).min(source.len());
        let end = (entry.offset as usize)
            .saturating_add(entry.original_size as usize)
            .min(source.len());
        source[start..end].to_vec()
    };

    let entry_folder = folder.join(&entry.output_name);
    ensure_dir(&entry_folder)?;
    let out_path = entry_folder.join(&entry.output_name);
    fs::write(&out_path, payload)
        .with_context(|| format!("Failed to write {}", out_path.display()))?;

    Ok(true)
}

fn write_manifest(paths: &VersionPaths, manifest: &FoundFiles) -> Result<()> {
    ensure_dir(&paths.output_folder)?;
    let json = serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;
    fs::write(&paths.found_files_path, json)
        .with_context(|| format!("Failed to write {}", paths.found_files_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CancelFlag, Version};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Collects driver messages instead of printing them.
    struct RecordingLog(Mutex<Vec<String>>);

    impl RecordingLog {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }
    }

    impl ScanLog for RecordingLog {
        fn message(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }

        fn progress(&self, _current: usize, _total: usize) {}
    }

    fn record_bytes(
        lookback: u8,
        repetition: u8,
        flag: u8,
        original_size: u32,
        offset: u32,
        compressed_size: u32,
    ) -> Vec<u8> {
        DataEntry {
            input: PathBuf::new(),
            output_name: String::new(),
            lookback_bit: lookback,
            repetition_bit: repetition,
            compression_flag: flag,
            original_size,
            offset,
            compressed_size,
        }
        .to_bytes()
        .unwrap()
    }

    fn place(buf: &mut [u8], offset: usize, bytes: &[u8]) {
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn sweep_emits_disjoint_raw_and_compressed_gaps() {
        let paths = VersionPaths::new(Version::Us);

        let payload: Vec<u8> = (0..0x400u32).map(|i| (i / 5) as u8).collect();
        let stream = lzss::compress(&payload, 11, 4);
        assert!(stream.len() < 0x800);

        // Zeros never decode (the first reference token is illegal), so
        // unclaimed zero sectors stay quiet.
        let mut data = vec![0u8; 0x4000];
        place(&mut data, 0x2000, &stream);

        let mut claimed = RangeSet::new();
        claimed.add(0..0x1000);

        let found = sweep_unreferenced(&claimed, &data, &paths);
        assert_eq!(found.len(), 2);

        let compressed = found
            .iter()
            .find(|e| e.compression_flag == FLAG_COMPRESSED)
            .unwrap();
        assert_eq!(compressed.offset, 0x2000);
        assert_eq!(compressed.compressed_size, 0x2000);
        assert!(compressed.original_size as usize >= payload.len());

        let raw = found.iter().find(|e| e.compression_flag == FLAG_RAW).unwrap();
        assert_eq!(raw.offset, 0x1000);
        assert_eq!(raw.original_size, 0x1000);
        assert_eq!(raw.compressed_size, 0x1000);

        for entry in &found {
            assert!(
                !claimed.overlaps(&entry.to_range()),
                "sweep emitted a claimed range: {:?}",
                entry.to_range()
            );
        }
    }

    #[test]
    fn sweep_of_fully_claimed_archive_is_empty() {
        let paths = VersionPaths::new(Version::Us);
        let data = vec![0u8; 0x2000];
        let mut claimed = RangeSet::new();
        claimed.add(0..0x2000);
        assert!(sweep_unreferenced(&claimed, &data, &paths).is_empty());
    }

    /// Build a miniature version tree: a main executable with three
    /// descriptors, a code archive holding one compressed rel (which
    /// itself references one more asset), and a data archive with one
    /// compressed asset, one raw asset, and one unclaimed gap.
    fn build_version_tree(root: &Path) -> (VersionPaths, Vec<u8>, Vec<u8>, Vec<u8>) {
        let paths = VersionPaths::with_roots(Version::Us, &root.join("data"), &root.join("outputs"));
        ensure_dir(paths.main_path.parent().unwrap()).unwrap();

        // Payloads with enough structure to compress well.
        let payload_a: Vec<u8> = (0..0x500u32).map(|i| (i / 7) as u8).collect();
        let stream_a = lzss::compress(&payload_a, 11, 4);
        assert!(stream_a.len() < 0x800);

        let raw_b: Vec<u8> = (0..0x320u32).map(|i| (i % 251) as u8 | 0x80).collect();

        let payload_d: Vec<u8> = (0..0x400u32).map(|i| (i / 3) as u8).collect();
        let stream_d = lzss::compress(&payload_d, 11, 4);
        assert!(stream_d.len() < 0x800);

        // The rel: a decompressed code blob carrying the descriptor for
        // asset D, surrounded by incompressible-looking filler.
        let mut rel_payload = vec![0xEEu8; 0x40];
        rel_payload.extend(record_bytes(
            11,
            4,
            FLAG_COMPRESSED,
            payload_d.len() as u32,
            0x2800,
            stream_d.len() as u32,
        ));
        rel_payload.extend(std::iter::repeat(0xEE).take(0x1B0));
        let rel_stream = lzss::compress(&rel_payload, 11, 4);
        assert!(rel_stream.len() < 0x800);

        // Data archive: asset B raw at 0x1000, asset A at 0x1800, a zero
        // gap at 0x2000, asset D at 0x2800.
        let mut data = vec![0u8; 0x3000];
        place(&mut data, 0x1000, &raw_b);
        place(&mut data, 0x1800, &stream_a);
        place(&mut data, 0x2800, &stream_d);
        fs::write(&paths.data_path, &data).unwrap();

        // Code archive: one rel at sector 0x800.
        let mut code = vec![0u8; 0x800];
        code.extend(&rel_stream);
        fs::write(&paths.code_path, &code).unwrap();

        // Main executable: descriptors for A, B, and the rel.
        let mut main = vec![0x23u8; 0x20];
        main.extend(record_bytes(
            11,
            4,
            FLAG_COMPRESSED,
            payload_a.len() as u32,
            0x1800,
            stream_a.len() as u32,
        ));
        main.extend([0x23; 8]);
        main.extend(record_bytes(0, 0, FLAG_RAW, raw_b.len() as u32, 0x1000, 0x321));
        main.extend([0x23; 8]);
        main.extend(record_bytes(
            11,
            4,
            FLAG_COMPRESSED,
            rel_payload.len() as u32,
            0x800,
            rel_stream.len() as u32,
        ));
        main.extend([0x23; 0x20]);
        fs::write(&paths.main_path, &main).unwrap();

        fs::write(
            &paths.known_files_path,
            r#"[{"Location": "0x1800", "Name": "Asset A.dat"}]"#,
        )
        .unwrap();

        (paths, payload_a, rel_payload, payload_d)
    }

    #[test]
    fn end_to_end_recovery_of_a_synthetic_version() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, payload_a, rel_payload, payload_d) = build_version_tree(dir.path());

        let cache = FileCache::new();
        let log = RecordingLog::new();
        let manifest =
            recover_version(&paths, &cache, &log, &CancelFlag::new()).unwrap();

        // The rel moved out of the referenced set and onto the code archive.
        assert_eq!(manifest.rels.len(), 1);
        let rel = &manifest.rels[0];
        assert_eq!(rel.offset, 0x800);
        assert_eq!(rel.input, paths.code_path);

        // Referenced: asset A (renamed by the sidecar) plus asset D found
        // inside the decompressed rel.
        assert_eq!(manifest.referenced.len(), 2);
        assert_eq!(manifest.referenced[0].offset, 0x1800);
        assert_eq!(manifest.referenced[0].output_name, "Asset A.dat");
        assert_eq!(manifest.referenced[1].offset, 0x2800);
        assert_eq!(manifest.referenced[1].input, paths.data_path);

        assert_eq!(manifest.raw.len(), 1);
        assert_eq!(manifest.raw[0].offset, 0x1000);

        assert!(manifest.adgc.is_empty());

        // The zero gap between asset A's sector and asset D's sector comes
        // back as one unreferenced raw segment.
        assert_eq!(manifest.unreferenced.len(), 1);
        let gap = &manifest.unreferenced[0];
        assert_eq!(gap.compression_flag, FLAG_RAW);
        assert_eq!(gap.offset, 0x2000);
        assert_eq!(gap.original_size, 0x800);

        // Payload files land as <category>/<name>/<name>.
        let a_file = paths
            .category_folder(REFERENCED_OUTPUT)
            .join("Asset A.dat")
            .join("Asset A.dat");
        assert_eq!(fs::read(a_file).unwrap(), payload_a);

        let d_name = DataEntry::default_output_name(11, 4, 0x2800);
        let d_file = paths
            .category_folder(REFERENCED_OUTPUT)
            .join(&d_name)
            .join(&d_name);
        assert_eq!(fs::read(d_file).unwrap(), payload_d);

        let rel_name = DataEntry::default_output_name(11, 4, 0x800);
        let rel_file = paths
            .category_folder(REL_OUTPUT)
            .join(&rel_name)
            .join(&rel_name);
        assert_eq!(fs::read(rel_file).unwrap(), rel_payload);

        // Manifest on disk round-trips through the JSON shape.
        let text = fs::read_to_string(&paths.found_files_path).unwrap();
        let reloaded: FoundFiles = serde_json::from_str(&text).unwrap();
        assert_eq!(reloaded.referenced, manifest.referenced);
        assert_eq!(reloaded.rels, manifest.rels);
        assert_eq!(reloaded.unreferenced, manifest.unreferenced);
    }

    #[test]
    fn cancelled_runs_write_no_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, ..) = build_version_tree(dir.path());

        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = recover_version(&paths, &FileCache::new(), &RecordingLog::new(), &cancel)
            .unwrap_err();
        assert!(err.is::<crate::common::Cancelled>());
        assert!(!paths.found_files_path.exists());
    }

    #[test]
    fn missing_inputs_surface_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let paths =
            VersionPaths::with_roots(Version::Jp, &dir.path().join("data"), &dir.path().join("out"));

        let err = recover_version(
            &paths,
            &FileCache::new(),
            &RecordingLog::new(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(err.is::<InvalidInputs>());
    }
}
