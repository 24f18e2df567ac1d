//! The [`FileInfo`] model: one manifest entry describing a single
//! file-system object, with a lazily computed content checksum.

use std::cell::OnceCell;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};

use crate::checksum::{self, Checksum};
use crate::error::{ArchiveError, Result};

/// The closed set of entry types an archive can hold.
///
/// `Other` classifies entries the archive cannot represent (FIFOs, sockets,
/// device nodes); they are skipped with a warning at creation time and are
/// never serialized into a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Dir,
    Symlink,
    Link,
    Other,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileType::File => "file",
            FileType::Dir => "directory",
            FileType::Symlink => "symbolic link",
            FileType::Link => "hard link",
            FileType::Other => "other",
        };
        f.write_str(s)
    }
}

/// One entry in a [`Manifest`](crate::manifest::Manifest).
///
/// The checksum is a lazy cache cell: constructing a `FileInfo` never reads
/// file content; the first call to [`FileInfo::checksum_with`] streams the
/// source exactly once and later calls return the cached value.
#[derive(Debug, Clone)]
pub struct FileInfo {
    path: PathBuf,
    ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: Option<String>,
    pub gname: Option<String>,
    /// Seconds since the epoch, with sub-second resolution where the file
    /// system provides it.
    pub mtime: f64,
    size: Option<u64>,
    target: Option<PathBuf>,
    checksum: OnceCell<Checksum>,
    /// Where the content can be read from for lazy checksum computation.
    /// Set for entries built from a live file system, absent for entries
    /// parsed from a manifest (those carry the checksum already).
    source: Option<PathBuf>,
}

fn lookup_user(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

fn lookup_group(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
}

fn classify(ft: fs::FileType) -> FileType {
    if ft.is_file() {
        FileType::File
    } else if ft.is_dir() {
        FileType::Dir
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::Other
    }
}

impl FileInfo {
    /// Build a `FileInfo` from a live file-system object.
    ///
    /// `path` is the name recorded in the archive; `fs_path` is where the
    /// object actually lives. Unsupported types yield `FileType::Other`,
    /// which the caller is expected to skip with a warning.
    pub fn from_path(path: PathBuf, fs_path: &Path) -> Result<FileInfo> {
        let meta = fs::symlink_metadata(fs_path).map_err(ArchiveError::io(fs_path))?;
        let ftype = classify(meta.file_type());
        let target = match ftype {
            FileType::Symlink => {
                Some(fs::read_link(fs_path).map_err(ArchiveError::io(fs_path))?)
            }
            _ => None,
        };
        Ok(FileInfo {
            path,
            ftype,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            uname: lookup_user(meta.uid()),
            gname: lookup_group(meta.gid()),
            mtime: meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9,
            size: (ftype == FileType::File).then(|| meta.len()),
            target,
            checksum: OnceCell::new(),
            source: (ftype == FileType::File).then(|| fs_path.to_path_buf()),
        })
    }

    /// Turn a regular-file entry into a hard link pointing at an earlier
    /// entry with identical content or inode.
    pub fn into_hard_link(mut self, target: PathBuf) -> FileInfo {
        debug_assert_eq!(self.ftype, FileType::File);
        self.ftype = FileType::Link;
        self.size = None;
        self.target = Some(target);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_type(&self) -> FileType {
        self.ftype
    }

    /// Size in bytes; meaningful for regular files only.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Symbolic-link target or hard-link target, depending on the type.
    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn is_file(&self) -> bool {
        self.ftype == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Dir
    }

    pub fn is_symlink(&self) -> bool {
        self.ftype == FileType::Symlink
    }

    pub fn is_link(&self) -> bool {
        self.ftype == FileType::Link
    }

    pub fn is_other(&self) -> bool {
        self.ftype == FileType::Other
    }

    /// The entry's content checksum, computing and caching it on first use.
    ///
    /// Defined for regular files only; hard links are resolved through
    /// [`Manifest::checksum_of`](crate::manifest::Manifest::checksum_of).
    pub fn checksum_with(&self, algorithm: &str) -> Result<&Checksum> {
        if let Some(cs) = self.checksum.get() {
            return Ok(cs);
        }
        if !self.is_file() {
            return Err(ArchiveError::InvalidArgument(format!(
                "{}: no checksum for entries of type {}",
                self.path.display(),
                self.ftype
            )));
        }
        let source = self.source.as_ref().ok_or_else(|| {
            ArchiveError::CorruptManifest(format!(
                "{}: file entry without checksum",
                self.path.display()
            ))
        })?;
        let cs = checksum::digest_file(algorithm, source)?;
        Ok(self.checksum.get_or_init(|| cs))
    }

    /// The checksum if it has been recorded or computed already; never
    /// triggers I/O.
    pub fn cached_checksum(&self) -> Option<&Checksum> {
        self.checksum.get()
    }

    pub(crate) fn to_record(&self, algorithm: &str) -> Result<FileRecord> {
        let checksum = match self.ftype {
            FileType::File => Some(self.checksum_with(algorithm)?.clone()),
            _ => None,
        };
        Ok(FileRecord {
            path: self.path.clone(),
            ftype: self.ftype,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            uname: self.uname.clone(),
            gname: self.gname.clone(),
            mtime: self.mtime,
            size: self.size,
            checksum,
            target: self.target.clone(),
        })
    }

    pub(crate) fn from_record(rec: FileRecord) -> Result<FileInfo> {
        let corrupt = |what: &str| {
            ArchiveError::CorruptManifest(format!("entry '{}': {}", rec.path.display(), what))
        };
        match rec.ftype {
            FileType::File => {
                if rec.size.is_none() {
                    return Err(corrupt("missing size"));
                }
                if rec.checksum.is_none() {
                    return Err(corrupt("missing checksum"));
                }
            }
            FileType::Symlink => {
                if rec.target.is_none() {
                    return Err(corrupt("missing symbolic link target"));
                }
            }
            FileType::Link => {
                if rec.target.is_none() {
                    return Err(corrupt("missing hard link target"));
                }
            }
            FileType::Dir => {}
            FileType::Other => return Err(corrupt("invalid entry type")),
        }
        let checksum = OnceCell::new();
        if let Some(cs) = rec.checksum {
            let _ = checksum.set(cs);
        }
        Ok(FileInfo {
            path: rec.path,
            ftype: rec.ftype,
            mode: rec.mode,
            uid: rec.uid,
            gid: rec.gid,
            uname: rec.uname,
            gname: rec.gname,
            mtime: rec.mtime,
            size: if rec.ftype == FileType::File { rec.size } else { None },
            target: rec.target,
            checksum,
            source: None,
        })
    }
}

/// The serialized shape of a manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FileRecord {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub mtime: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn regular_file_attributes() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let fs_path = dir.path().join("data.txt");
        let mut f = fs::File::create(&fs_path)?;
        f.write_all(b"some data")?;
        drop(f);

        let fi = FileInfo::from_path(PathBuf::from("base/data.txt"), &fs_path)?;
        assert!(fi.is_file());
        assert_eq!(fi.size(), Some(9));
        assert_eq!(fi.path(), Path::new("base/data.txt"));
        assert!(fi.target().is_none());
        Ok(())
    }

    #[test]
    fn checksum_is_lazy_and_cached() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let fs_path = dir.path().join("data.txt");
        fs::write(&fs_path, b"Hello world!\n")?;

        let fi = FileInfo::from_path(PathBuf::from("data.txt"), &fs_path)?;
        // No content read yet.
        assert!(fi.cached_checksum().is_none());

        let first = fi.checksum_with("sha256")?.clone();
        // Changing the file after the first read must not change the cached
        // value: the second access performs no I/O.
        fs::write(&fs_path, b"different content")?;
        let second = fi.checksum_with("sha256")?;
        assert_eq!(&first, second);
        Ok(())
    }

    #[test]
    fn checksum_refused_for_directories() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let fi = FileInfo::from_path(PathBuf::from("base"), dir.path())?;
        assert!(fi.is_dir());
        assert!(fi.checksum_with("sha256").is_err());
        Ok(())
    }

    #[test]
    fn symlink_records_target() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("somewhere/else", &link)?;
        let fi = FileInfo::from_path(PathBuf::from("link"), &link)?;
        assert!(fi.is_symlink());
        assert_eq!(fi.target(), Some(Path::new("somewhere/else")));
        assert!(fi.size().is_none());
        Ok(())
    }

    #[test]
    fn record_round_trip_preserves_checksum() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let fs_path = dir.path().join("data.txt");
        fs::write(&fs_path, b"Hello world!\n")?;

        let fi = FileInfo::from_path(PathBuf::from("data.txt"), &fs_path)?;
        let rec = fi.to_record("sha256")?;
        let parsed = FileInfo::from_record(rec)?;
        // The parsed entry has no source path but carries the checksum.
        assert_eq!(parsed.cached_checksum(), fi.cached_checksum());
        assert_eq!(parsed.checksum_with("sha256")?, fi.checksum_with("sha256")?);
        Ok(())
    }

    #[test]
    fn file_record_without_checksum_is_rejected() {
        let rec = FileRecord {
            path: PathBuf::from("f"),
            ftype: FileType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mtime: 0.0,
            size: Some(1),
            checksum: None,
            target: None,
        };
        let err = FileInfo::from_record(rec).unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptManifest(_)));
    }
}
