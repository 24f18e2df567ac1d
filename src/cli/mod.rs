//! Command-line surface: argument definitions and the plain-text
//! formatting used by the listing commands. The actual dispatch lives in
//! `main.rs`; everything here is a pure function over the core types.

use chrono::TimeZone;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::archive::Compression;
use crate::dedup::DedupMode;
use crate::error::{ArchiveError, Result};
use crate::fileinfo::{FileInfo, FileType};
use crate::manifest::Manifest;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new archive from the given files and directories.
    #[command(alias = "c")]
    Create {
        /// The path for the output archive file (e.g. backup.tar.gz).
        archive: PathBuf,

        /// Files and directories to add, relative to the work directory.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Change into this directory before reading the input paths.
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,

        /// Common base directory in the archive. Defaults to the first
        /// component of the first path.
        #[arg(long)]
        basedir: Option<PathBuf>,

        /// Leave this path (and everything below it) out of the archive.
        /// May be given more than once.
        #[arg(long = "exclude")]
        excludes: Vec<PathBuf>,

        /// Compression mode; inferred from the archive suffix when absent.
        #[arg(long, value_enum)]
        compression: Option<Compression>,

        /// When to store duplicate files as hard links.
        #[arg(long, value_enum, default_value_t = DedupMode::Link)]
        deduplicate: DedupMode,

        /// Attach a tag to the archive. May be given more than once.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Verify integrity of the archive against its manifest.
    Verify {
        /// The path to the archive file.
        archive: PathBuf,
    },

    /// Extract files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The path to the archive file.
        archive: PathBuf,

        /// Specific entries to extract. If empty, the whole archive is
        /// extracted.
        entries: Vec<PathBuf>,

        /// The directory where files will be extracted.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// List files in the archive.
    #[command(alias = "l")]
    Ls {
        /// Output style.
        #[arg(long, value_enum, default_value_t = LsFormat::Ls)]
        format: LsFormat,

        /// Hash algorithm for the checksum format. Defaults to the
        /// strongest one recorded in the manifest.
        #[arg(long)]
        checksum: Option<String>,

        /// The path to the archive file.
        archive: PathBuf,
    },

    /// Show information about an entry in the archive.
    Info {
        /// The path to the archive file.
        archive: PathBuf,

        /// Archive path of the entry.
        entry: PathBuf,
    },

    /// Show the differences between two archives.
    Diff {
        /// Also report entries that only differ in file system metadata.
        #[arg(long)]
        report_meta: bool,

        /// First archive to compare.
        archive1: PathBuf,

        /// Second archive to compare.
        archive2: PathBuf,
    },

    /// Compare the archive against the directory tree it was created from.
    Check {
        /// Also report entries that only differ in file system metadata.
        #[arg(long)]
        report_meta: bool,

        /// Do not descend into manifest directories that differ; the
        /// directory's own verdict is still reported.
        #[arg(long)]
        skip_dir_content: bool,

        /// Also report files on disk that are not in the archive.
        #[arg(long)]
        report_added: bool,

        /// Directory the archive was created from.
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,

        /// The path to the archive file.
        archive: PathBuf,
    },
}

/// Output style of the `ls` subcommand.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LsFormat {
    /// `ls -l` style listing: mode, owner, size, mtime, path.
    Ls,
    /// `sha256sum` style listing: checksum and path of regular files.
    Checksum,
}

/// Parses command-line arguments and returns the command to execute.
pub fn run() -> Commands {
    Args::parse().command
}

/// Render a mode as the usual `-rwxr-xr-x` string, with the entry type in
/// the first column.
pub fn filemode(ftype: FileType, mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(match ftype {
        FileType::Dir => 'd',
        FileType::Symlink => 'l',
        FileType::File | FileType::Link => '-',
        FileType::Other => '?',
    });
    let rwx = |s: &mut String, bits: u32, special: u32, ch: char| {
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(match (bits & 0o1 != 0, special != 0) {
            (true, false) => 'x',
            (false, false) => '-',
            (true, true) => ch,
            (false, true) => ch.to_ascii_uppercase(),
        });
    };
    rwx(&mut s, (mode >> 6) & 0o7, mode & 0o4000, 's');
    rwx(&mut s, (mode >> 3) & 0o7, mode & 0o2000, 's');
    rwx(&mut s, mode & 0o7, mode & 0o1000, 't');
    s
}

fn format_mtime(mtime: f64) -> String {
    let secs = mtime.floor() as i64;
    match chrono::Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("@{}", secs),
    }
}

fn owner(fi: &FileInfo) -> String {
    let user = fi.uname.clone().unwrap_or_else(|| fi.uid.to_string());
    let group = fi.gname.clone().unwrap_or_else(|| fi.gid.to_string());
    format!("{}/{}", user, group)
}

fn display_path(fi: &FileInfo) -> String {
    match (fi.file_type(), fi.target()) {
        (FileType::Symlink, Some(t)) => {
            format!("{} -> {}", fi.path().display(), t.display())
        }
        (FileType::Link, Some(t)) => {
            format!("{} link to {}", fi.path().display(), t.display())
        }
        _ => fi.path().display().to_string(),
    }
}

/// The `ls -l` style listing, owner and size columns right-aligned to
/// their widest value.
pub fn ls_lines(manifest: &Manifest) -> Vec<String> {
    let rows: Vec<(String, String, String, String, String)> = manifest
        .iter()
        .map(|fi| {
            (
                filemode(fi.file_type(), fi.mode),
                owner(fi),
                fi.size().unwrap_or(0).to_string(),
                format_mtime(fi.mtime),
                display_path(fi),
            )
        })
        .collect();
    let l_ug = rows.iter().map(|r| r.1.len()).max().unwrap_or(0);
    let l_s = rows.iter().map(|r| r.2.len()).max().unwrap_or(0);
    rows.into_iter()
        .map(|(mode, ug, size, mtime, path)| {
            format!("{}  {:>l_ug$}  {:>l_s$}  {}  {}", mode, ug, size, mtime, path)
        })
        .collect()
}

/// The checksum listing: `<hex>  <path>` for every entry with content,
/// hard links resolved through their target.
pub fn checksum_lines(manifest: &Manifest, algorithm: Option<&str>) -> Result<Vec<String>> {
    if let Some(algorithm) = algorithm {
        if !manifest.checksums.iter().any(|a| a == algorithm) {
            return Err(ArchiveError::Format(format!(
                "checksums using '{}' hashes not available",
                algorithm
            )));
        }
    }
    let mut lines = Vec::new();
    for fi in manifest.iter() {
        if !fi.is_file() && !fi.is_link() {
            continue;
        }
        let cs = manifest.checksum_of(fi)?;
        lines.push(format!("{}  {}", cs.hex, fi.path().display()));
    }
    Ok(lines)
}

/// The per-entry detail block printed by the `info` subcommand.
pub fn info_lines(fi: &FileInfo) -> Vec<String> {
    let mut lines = vec![
        format!("Path:   {}", fi.path().display()),
        format!("Type:   {}", fi.file_type()),
        format!("Mode:   {}", filemode(fi.file_type(), fi.mode)),
        format!(
            "Owner:  {}:{} ({}:{})",
            fi.uname.as_deref().unwrap_or("-"),
            fi.gname.as_deref().unwrap_or("-"),
            fi.uid,
            fi.gid
        ),
        format!("Mtime:  {}", format_mtime(fi.mtime)),
    ];
    if let Some(size) = fi.size() {
        lines.push(format!("Size:   {}", size));
    }
    if let Some(target) = fi.target() {
        lines.push(format!("Target: {}", target.display()));
    }
    lines
}
