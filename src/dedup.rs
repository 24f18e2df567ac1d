//! Creation-time deduplication: decide whether a regular file should be
//! stored in full or as a hard link to an earlier entry.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use clap::ValueEnum;

use crate::error::Result;
use crate::fileinfo::FileInfo;

/// Policy controlling when duplicate files are collapsed into hard links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupMode {
    /// Always store the full content, even for hard-linked source files.
    Never,
    /// Store as a hard link only if the source files already share an inode.
    Link,
    /// Store as a hard link whenever two files have bit-identical content,
    /// regardless of source linkage.
    Content,
}

impl std::fmt::Display for DedupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DedupMode::Never => "never",
            DedupMode::Link => "link",
            DedupMode::Content => "content",
        };
        f.write_str(s)
    }
}

/// Tracks file identities seen so far during one traversal.
///
/// Keys regular files by (device, inode) and, under
/// [`DedupMode::Content`], additionally by content checksum. The checksum
/// index forces an eager digest of every regular file, deliberately
/// trading away checksum laziness in that one mode.
#[derive(Debug)]
pub struct DedupIndex {
    mode: DedupMode,
    by_inode: HashMap<(u64, u64), PathBuf>,
    by_content: HashMap<String, PathBuf>,
}

impl DedupIndex {
    pub fn new(mode: DedupMode) -> DedupIndex {
        DedupIndex { mode, by_inode: HashMap::new(), by_content: HashMap::new() }
    }

    /// Classify a regular-file candidate. Returns the archive path of the
    /// earlier entry it duplicates, or `None` if it must be stored in full.
    ///
    /// `fi` must be a regular-file entry and `meta` its lstat result.
    /// Symbolic links and directories are never candidates; callers do not
    /// pass them here.
    pub fn check(&mut self, fi: &FileInfo, meta: &Metadata) -> Result<Option<PathBuf>> {
        debug_assert!(fi.is_file());
        if self.mode == DedupMode::Never {
            return Ok(None);
        }

        // Inode identity first: a match means the source files are already
        // hard-linked and the content need not be read at all.
        let ino_key = (meta.dev(), meta.ino());
        if let Some(first) = self.by_inode.get(&ino_key) {
            return Ok(Some(first.clone()));
        }
        // Under Link, files with a single link can never match a later
        // candidate by inode, so don't index them. This also keeps
        // unrelated zero-byte files apart.
        if self.mode == DedupMode::Content || meta.nlink() > 1 {
            self.by_inode.insert(ino_key, fi.path().to_path_buf());
        }

        if self.mode == DedupMode::Content {
            let cs = fi.checksum_with(crate::checksum::DEFAULT_ALGORITHM)?;
            if let Some(first) = self.by_content.get(&cs.hex) {
                return Ok(Some(first.clone()));
            }
            self.by_content.insert(cs.hex.clone(), fi.path().to_path_buf());
        }

        Ok(None)
    }
}
