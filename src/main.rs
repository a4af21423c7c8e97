/*!
# MSSB Asset Recovery Tool

A cross-platform tool for recovering embedded assets from the disc images
of Mario Superstar Baseball (US, JP, EU, DEMO) and its FS03 location-test
build. The discs carry no central file index; assets are rediscovered from
descriptor fingerprints in the executables and from structural scanning of
the data archive.
*/

// Import the libraries we need
use anyhow::{Context, Result}; // For easy error handling
use clap::{Parser, Subcommand}; // For command-line argument parsing
use std::fs;
use std::path::{Path, PathBuf}; // For cross-platform file paths

// Use a faster memory allocator on Linux (optional optimization)
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// Our own modules that implement asset discovery
mod bitbuf; // Bit-level word buffer under the codec
mod common; // Versions, paths, cache, log/cancel contracts
mod entry; // The 16-byte descriptor record
mod lzss; // Parametric LZSS codec
mod ranges; // Disjoint range set for archive occupancy
mod recover; // The per-version recovery driver
mod scan; // Fingerprint scanner

use common::{
    CancelFlag, ConsoleLog, FileCache, ScanLog, Version, VersionPaths, ADGC_OUTPUT, INPUT_FOLDER,
    OUTPUT_FOLDER, RAW_OUTPUT, REFERENCED_OUTPUT, REL_OUTPUT, UNREFERENCED_OUTPUT,
};

/// Command-line interface definition, parsed by clap
#[derive(Parser)]
#[command(name = "mssbrec")]
#[command(version)]
#[command(about = "Mario Superstar Baseball asset recovery cli")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// All the commands our tool supports
#[derive(Subcommand)]
enum Commands {
    /// Recover assets for one version, or for every version (command: x)
    #[command(name = "x")]
    Extract {
        /// Which disc version to recover (all versions when omitted)
        #[arg(short, long)]
        version: Option<Version>,
        /// Re-run versions that already have a manifest
        #[arg(short, long)]
        force: bool,
        /// Where the per-version input folders live
        #[arg(short, long, default_value = INPUT_FOLDER)]
        input: PathBuf,
        /// Where to put recovered files
        #[arg(short, long, default_value = OUTPUT_FOLDER)]
        output: PathBuf,
    },

    /// List recovered assets from a version's manifest (command: l)
    #[command(name = "l")]
    List {
        /// Which version's manifest to read
        version: Version,
        /// Where recovered files were put
        #[arg(short, long, default_value = OUTPUT_FOLDER)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            version,
            force,
            input,
            output,
        } => {
            let log = ConsoleLog;
            let cancel = CancelFlag::new();
            let cache = FileCache::new();

            match version {
                Some(version) => {
                    // A named version must be complete; missing inputs are
                    // an error here, not a skip.
                    let paths = VersionPaths::with_roots(version, &input, &output);
                    recover::recover_version(&paths, &cache, &log, &cancel)?;
                }
                None => {
                    for version in Version::ALL {
                        let paths = VersionPaths::with_roots(version, &input, &output);
                        if !paths.valid() {
                            log.message(&format!(
                                "{version}: couldn't find relevant files, skipping"
                            ));
                            continue;
                        }
                        if paths.extracted() && !force {
                            log.message(&format!("{version} already extracted, skipping..."));
                            continue;
                        }
                        recover::recover_version(&paths, &cache, &log, &cancel)?;
                    }
                    log.message("Done");
                }
            }
        }

        Commands::List { version, output } => {
            list_manifest(version, &output)?;
        }
    }

    Ok(())
}

/// Print a version's recovered assets, grouped by category.
fn list_manifest(version: Version, output_root: &Path) -> Result<()> {
    let paths = VersionPaths::with_roots(version, Path::new(INPUT_FOLDER), output_root);
    let text = fs::read_to_string(&paths.found_files_path).with_context(|| {
        format!(
            "Failed to read {} (has this version been extracted?)",
            paths.found_files_path.display()
        )
    })?;
    let manifest: recover::FoundFiles = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", paths.found_files_path.display()))?;

    let categories = [
        (REL_OUTPUT, &manifest.rels),
        (RAW_OUTPUT, &manifest.raw),
        (REFERENCED_OUTPUT, &manifest.referenced),
        (ADGC_OUTPUT, &manifest.adgc),
        (UNREFERENCED_OUTPUT, &manifest.unreferenced),
    ];

    for (name, entries) in categories {
        println!("{name} ({} files)", entries.len());
        for entry in entries {
            println!(
                "  {:08x}  {:>9}  {:>9}  {}",
                entry.offset, entry.compressed_size, entry.original_size, entry.output_name
            );
        }
        println!();
    }

    Ok(())
}
