/*!
# Common Types and Utilities

Shared plumbing for the recovery driver and the CLI: the version table and
its per-version file layout, the lazy byte cache, the logging/progress/
cancellation contracts the driver is handed, and the small error types
that cross module boundaries.
*/

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root of the per-version input trees.
pub const INPUT_FOLDER: &str = "data";
/// Root of the per-version output trees.
pub const OUTPUT_FOLDER: &str = "outputs";

/// Optional sidecar supplying names keyed by disk offset.
pub const KNOWN_FILES: &str = "FileNames.json";
/// The per-version result manifest.
pub const FOUND_FILES: &str = "FoundFiles.json";

pub const MAIN_DOL: &str = "main.dol";

// Category folder names, also the manifest's array keys.
pub const REL_OUTPUT: &str = "Rels";
pub const RAW_OUTPUT: &str = "Raw files";
pub const REFERENCED_OUTPUT: &str = "Referenced files";
pub const ADGC_OUTPUT: &str = "AdGCForms";
pub const UNREFERENCED_OUTPUT: &str = "Unreferenced files";

/// The five known disc variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Version {
    Us,
    Jp,
    Eu,
    Demo,
    Fs03,
}

impl Version {
    pub const ALL: [Version; 5] = [
        Version::Us,
        Version::Jp,
        Version::Eu,
        Version::Demo,
        Version::Fs03,
    ];

    /// Directory name under `data/` and `outputs/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Version::Us => "US",
            Version::Jp => "JP",
            Version::Eu => "EU",
            Version::Demo => "DEMO",
            Version::Fs03 => "FS03",
        }
    }

    /// FS03 is the only variant with its own archive naming convention.
    fn code_file(&self) -> &'static str {
        match self {
            Version::Fs03 => "fqp.dat",
            _ => "aaaa.dat",
        }
    }

    fn data_file(&self) -> &'static str {
        match self {
            Version::Fs03 => "fq.dat",
            _ => "ZZZZ.dat",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Input and output locations for one version run.
#[derive(Debug, Clone)]
pub struct VersionPaths {
    pub version: Version,
    pub main_path: PathBuf,
    pub code_path: PathBuf,
    pub data_path: PathBuf,
    pub known_files_path: PathBuf,
    pub output_folder: PathBuf,
    pub found_files_path: PathBuf,
}

impl VersionPaths {
    pub fn new(version: Version) -> Self {
        Self::with_roots(version, Path::new(INPUT_FOLDER), Path::new(OUTPUT_FOLDER))
    }

    pub fn with_roots(version: Version, input_root: &Path, output_root: &Path) -> Self {
        let input_folder = input_root.join(version.dir_name());
        let output_folder = output_root.join(version.dir_name());
        Self {
            version,
            main_path: input_folder.join(MAIN_DOL),
            code_path: input_folder.join(version.code_file()),
            data_path: input_folder.join(version.data_file()),
            known_files_path: input_folder.join(KNOWN_FILES),
            found_files_path: output_folder.join(FOUND_FILES),
            output_folder,
        }
    }

    /// All three binary inputs are present.
    pub fn valid(&self) -> bool {
        self.main_path.exists() && self.code_path.exists() && self.data_path.exists()
    }

    /// A previous run already produced a manifest.
    pub fn extracted(&self) -> bool {
        self.found_files_path.exists()
    }

    pub fn category_folder(&self, category: &str) -> PathBuf {
        self.output_folder.join(category)
    }
}

/// The version is missing one or more of its input files.
#[derive(Debug, Error)]
#[error("missing input files for version {0}")]
pub struct InvalidInputs(pub Version);

/// The run was cancelled through the shared flag.
#[derive(Debug, Clone, Copy, Error)]
#[error("run cancelled")]
pub struct Cancelled;

/// Cooperative cancellation token, polled between scan phases and between
/// per-entry extractions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Message and progress sink for a recovery run. The driver never talks to
/// stdout directly; the shell decides where this goes.
pub trait ScanLog: Sync {
    fn message(&self, text: &str);
    fn progress(&self, current: usize, total: usize);
}

/// Plain stdout logging for CLI runs.
pub struct ConsoleLog;

impl ScanLog for ConsoleLog {
    fn message(&self, text: &str) {
        println!("{text}");
    }

    fn progress(&self, current: usize, total: usize) {
        if total > 0 && (current % 50 == 0 || current == total) {
            println!("Progress: {current}/{total}");
        }
    }
}

/// Lazy path-keyed byte cache. Loaded files are kept for the whole run and
/// handed out as shared buffers, so the extraction pool can read them
/// without copies.
#[derive(Debug, Default)]
pub struct FileCache {
    cache: Mutex<HashMap<PathBuf, Arc<Vec<u8>>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self, path: &Path) -> Result<Arc<Vec<u8>>> {
        let mut cache = self.cache.lock().expect("file cache mutex poisoned");
        if let Some(bytes) = cache.get(path) {
            return Ok(Arc::clone(bytes));
        }

        let bytes = Arc::new(
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
        );
        cache.insert(path.to_path_buf(), Arc::clone(&bytes));
        Ok(bytes)
    }
}

/// One record of the `FileNames.json` sidecar.
#[derive(Debug, Serialize, Deserialize)]
pub struct KnownFileName {
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Load the sidecar name list, keyed by disk offset. A missing file is an
/// empty mapping, not an error.
pub fn load_known_files(path: &Path) -> Result<HashMap<u32, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let records: Vec<KnownFileName> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let mut names = HashMap::new();
    for record in records {
        let digits = record.location.trim_start_matches("0x");
        let offset = u32::from_str_radix(digits, 16)
            .with_context(|| format!("Invalid offset {:?} in known file list", record.location))?;
        names.insert(offset, record.name);
    }
    Ok(names)
}

/// Create a directory (and its parents) if it doesn't exist yet.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_per_version() {
        let us = VersionPaths::new(Version::Us);
        assert_eq!(us.code_path, Path::new("data/US/aaaa.dat"));
        assert_eq!(us.data_path, Path::new("data/US/ZZZZ.dat"));
        assert_eq!(us.main_path, Path::new("data/US/main.dol"));
        assert_eq!(us.found_files_path, Path::new("outputs/US/FoundFiles.json"));

        let fs03 = VersionPaths::new(Version::Fs03);
        assert_eq!(fs03.code_path, Path::new("data/FS03/fqp.dat"));
        assert_eq!(fs03.data_path, Path::new("data/FS03/fq.dat"));
    }

    #[test]
    fn custom_roots_are_respected() {
        let paths =
            VersionPaths::with_roots(Version::Jp, Path::new("/tmp/in"), Path::new("/tmp/out"));
        assert_eq!(paths.data_path, Path::new("/tmp/in/JP/ZZZZ.dat"));
        assert_eq!(
            paths.category_folder(REL_OUTPUT),
            Path::new("/tmp/out/JP/Rels")
        );
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(flag.check().is_err());
    }

    #[test]
    fn file_cache_reads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, b"payload").unwrap();

        let cache = FileCache::new();
        let first = cache.bytes(&path).unwrap();
        assert_eq!(first.as_slice(), b"payload");

        // Later reads come from the cache, not the (now changed) file.
        fs::write(&path, b"different").unwrap();
        let second = cache.bytes(&path).unwrap();
        assert_eq!(second.as_slice(), b"payload");
    }

    #[test]
    fn known_files_parse_hex_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KNOWN_FILES);
        fs::write(
            &path,
            r#"[{"Location": "0x800", "Name": "Stadium.dat"},
               {"Location": "0x2000", "Name": "Title.dat"}]"#,
        )
        .unwrap();

        let names = load_known_files(&path).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[&0x800], "Stadium.dat");
        assert_eq!(names[&0x2000], "Title.dat");

        assert!(load_known_files(&dir.path().join("missing.json"))
            .unwrap()
            .is_empty());
    }
}
