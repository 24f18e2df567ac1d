//! The [`Manifest`]: a versioned, ordered listing of every entry in an
//! archive, serialized as the container's first member so consumers can
//! inspect an archive without touching the bulk data.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksum::{Checksum, DEFAULT_ALGORITHM};
use crate::error::{ArchiveError, Result};
use crate::fileinfo::{FileInfo, FileRecord};

/// Name of the manifest member inside the container, relative to the
/// archive's base directory.
pub const MANIFEST_NAME: &str = ".manifest.json";

/// Format version written by this build, as a (major, minor) pair.
///
/// Readers reject unknown major versions and tolerate newer minors.
pub const FORMAT_VERSION: (u32, u32) = (1, 1);

/// One free-form metadata record attached to the whole archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// The ordered collection of [`FileInfo`] entries plus the archive-wide
/// header: format version, metadata items and tags.
///
/// Entry order is the creation-time traversal order and is preserved
/// across serialization; [`Manifest::sort`] gives a canonical by-path
/// order for listing without affecting the container.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub version: (u32, u32),
    pub generator: String,
    pub date: String,
    /// Digest algorithms the entries carry, strongest first.
    pub checksums: Vec<String>,
    metadata: Vec<MetadataItem>,
    tags: BTreeSet<String>,
    entries: Vec<FileInfo>,
    index: HashMap<PathBuf, usize>,
}

#[derive(Serialize, Deserialize)]
struct ManifestDoc {
    version: String,
    #[serde(default)]
    generator: String,
    #[serde(default)]
    date: String,
    #[serde(default = "default_checksums")]
    checksums: Vec<String>,
    #[serde(default)]
    metadata: Vec<MetadataItem>,
    #[serde(default)]
    tags: BTreeSet<String>,
    entries: Vec<FileRecord>,
}

fn default_checksums() -> Vec<String> {
    vec![DEFAULT_ALGORITHM.to_string()]
}

fn now_str() -> String {
    chrono::Local::now().format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

fn parse_version(s: &str) -> Result<(u32, u32)> {
    let bad = || ArchiveError::Format(format!("invalid manifest version '{}'", s));
    let (major, minor) = s.split_once('.').ok_or_else(bad)?;
    Ok((major.parse().map_err(|_| bad())?, minor.parse().map_err(|_| bad())?))
}

fn build_index(entries: &[FileInfo]) -> Result<HashMap<PathBuf, usize>> {
    let mut index = HashMap::with_capacity(entries.len());
    for (i, fi) in entries.iter().enumerate() {
        if index.insert(fi.path().to_path_buf(), i).is_some() {
            return Err(ArchiveError::CorruptManifest(format!(
                "duplicate path '{}'",
                fi.path().display()
            )));
        }
    }
    Ok(index)
}

impl Manifest {
    /// Build a fresh manifest from traversal output.
    ///
    /// Fails with [`ArchiveError::CorruptManifest`] if a path occurs twice.
    pub fn new(
        entries: Vec<FileInfo>,
        tags: impl IntoIterator<Item = String>,
        metadata: Vec<MetadataItem>,
    ) -> Result<Manifest> {
        let index = build_index(&entries)?;
        Ok(Manifest {
            version: FORMAT_VERSION,
            generator: concat!("tarmeta ", env!("CARGO_PKG_VERSION")).to_string(),
            date: now_str(),
            checksums: default_checksums(),
            metadata,
            tags: tags.into_iter().collect(),
            entries,
            index,
        })
    }

    /// Parse a manifest document, typically the first container member.
    ///
    /// Unparseable input and unknown major versions are
    /// [`ArchiveError::Format`]; structural invariant violations are
    /// [`ArchiveError::CorruptManifest`].
    pub fn parse<R: Read>(reader: R) -> Result<Manifest> {
        let doc: ManifestDoc = serde_json::from_reader(reader)
            .map_err(|e| ArchiveError::Format(format!("not a parseable manifest: {}", e)))?;
        let version = parse_version(&doc.version)?;
        if version.0 != FORMAT_VERSION.0 {
            return Err(ArchiveError::Format(format!(
                "unsupported manifest version {}",
                doc.version
            )));
        }
        let entries = doc
            .entries
            .into_iter()
            .map(FileInfo::from_record)
            .collect::<Result<Vec<_>>>()?;
        let index = build_index(&entries)?;
        Ok(Manifest {
            version,
            generator: doc.generator,
            date: doc.date,
            checksums: doc.checksums,
            metadata: doc.metadata,
            tags: doc.tags,
            entries,
            index,
        })
    }

    /// Serialize the manifest. Deterministic for a given entry order; this
    /// is where lazy checksums of freshly traversed entries get forced.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let algorithm = self.algorithm();
        let doc = ManifestDoc {
            version: format!("{}.{}", self.version.0, self.version.1),
            generator: self.generator.clone(),
            date: self.date.clone(),
            checksums: self.checksums.clone(),
            metadata: self.metadata.clone(),
            tags: self.tags.clone(),
            entries: self
                .entries
                .iter()
                .map(|fi| fi.to_record(algorithm))
                .collect::<Result<Vec<_>>>()?,
        };
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| ArchiveError::Format(format!("cannot serialize manifest: {}", e)))?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// The digest algorithm the entries carry.
    pub fn algorithm(&self) -> &str {
        self.checksums.first().map(String::as_str).unwrap_or(DEFAULT_ALGORITHM)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileInfo> {
        self.entries.iter()
    }

    /// Look up an entry by its archive path.
    pub fn find(&self, path: &Path) -> Option<&FileInfo> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    /// Reorder entries by path for canonical listing. Does not affect the
    /// on-disk member order of an existing container.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.path().cmp(b.path()));
        for (i, fi) in self.entries.iter().enumerate() {
            self.index.insert(fi.path().to_path_buf(), i);
        }
    }

    /// The common base directory of all entries, derived from the first
    /// path component.
    pub fn basedir(&self) -> Option<&Path> {
        let first = self.entries.first()?;
        let mut comps = first.path().components();
        let head = comps.next()?;
        Some(Path::new(head.as_os_str()))
    }

    /// Resolve an entry's checksum, following hard links to their target.
    /// The entry may come from this manifest or stand alone, so the
    /// returned borrow is tied to both.
    pub fn checksum_of<'a>(&'a self, fi: &'a FileInfo) -> Result<&'a Checksum> {
        if fi.is_link() {
            let target = fi.target().ok_or_else(|| {
                ArchiveError::CorruptManifest(format!(
                    "entry '{}': missing hard link target",
                    fi.path().display()
                ))
            })?;
            let resolved = self.find(target).ok_or_else(|| {
                ArchiveError::CorruptManifest(format!(
                    "entry '{}': hard link target '{}' not in manifest",
                    fi.path().display(),
                    target.display()
                ))
            })?;
            if !resolved.is_file() {
                return Err(ArchiveError::CorruptManifest(format!(
                    "entry '{}': hard link target '{}' is not a regular file",
                    fi.path().display(),
                    target.display()
                )));
            }
            return resolved.checksum_with(self.algorithm());
        }
        fi.checksum_with(self.algorithm())
    }

    /// Ordered metadata items attached to the archive.
    pub fn metadata(&self) -> &[MetadataItem] {
        &self.metadata
    }

    /// Append a metadata item. Persisted on the next write of the container.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push(MetadataItem { key: key.into(), value: value.into() });
    }

    /// The value of the first metadata item with the given key, if any.
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }
}
