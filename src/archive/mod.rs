//! The archive engine: creating, opening, verifying, extracting and
//! rewriting manifest-carrying tar containers.
//!
//! A container is an ordinary (optionally compressed) tar file whose first
//! member is the JSON manifest, followed by the member bodies in manifest
//! order. Everything a consumer needs to answer "what is in here, is it
//! intact" is in that first member.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use filetime::FileTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::checksum;
use crate::dedup::{DedupIndex, DedupMode};
use crate::error::{ArchiveError, ArchiveWarning, FailureKind, Result, VerifyFailure};
use crate::fileinfo::{FileInfo, FileType};
use crate::manifest::{Manifest, MetadataItem, MANIFEST_NAME};

/// Compression applied to the tar container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Compression {
    /// Plain, uncompressed tar.
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Infer the compression from a container file name, e.g.
    /// `backup.tar.gz` or `backup.tgz`. Returns `None` for unknown
    /// suffixes so callers can apply their own default.
    pub fn from_suffix(path: &Path) -> Option<Compression> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".tar") {
            Some(Compression::None)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Compression::Gzip)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Compression::Xz)
        } else if name.ends_with(".tar.zst") {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    /// Detect the compression of an existing container from its magic
    /// bytes. Anything unrecognized is treated as plain tar.
    fn sniff(file: &mut File) -> io::Result<Compression> {
        let mut magic = [0u8; 6];
        let mut filled = 0;
        while filled < magic.len() {
            let n = file.read(&mut magic[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        file.seek(SeekFrom::Start(0))?;
        let c = if magic[..2] == [0x1f, 0x8b] {
            Compression::Gzip
        } else if magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
            Compression::Xz
        } else if magic[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
            Compression::Zstd
        } else {
            Compression::None
        };
        Ok(c)
    }
}

enum ContainerWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
    Xz(XzEncoder<File>),
    Zstd(zstd::stream::write::Encoder<'static, File>),
}

impl ContainerWriter {
    fn new(file: File, compression: Compression) -> io::Result<ContainerWriter> {
        Ok(match compression {
            Compression::None => ContainerWriter::Plain(file),
            Compression::Gzip => {
                ContainerWriter::Gzip(GzEncoder::new(file, flate2::Compression::default()))
            }
            Compression::Xz => ContainerWriter::Xz(XzEncoder::new(file, 6)),
            Compression::Zstd => {
                ContainerWriter::Zstd(zstd::stream::write::Encoder::new(file, 0)?)
            }
        })
    }

    fn finish(self) -> io::Result<File> {
        match self {
            ContainerWriter::Plain(f) => Ok(f),
            ContainerWriter::Gzip(w) => w.finish(),
            ContainerWriter::Xz(w) => w.finish(),
            ContainerWriter::Zstd(w) => w.finish(),
        }
    }
}

impl Write for ContainerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ContainerWriter::Plain(w) => w.write(buf),
            ContainerWriter::Gzip(w) => w.write(buf),
            ContainerWriter::Xz(w) => w.write(buf),
            ContainerWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ContainerWriter::Plain(w) => w.flush(),
            ContainerWriter::Gzip(w) => w.flush(),
            ContainerWriter::Xz(w) => w.flush(),
            ContainerWriter::Zstd(w) => w.flush(),
        }
    }
}

enum ContainerReader {
    Plain(BufReader<File>),
    Gzip(GzDecoder<BufReader<File>>),
    Xz(XzDecoder<BufReader<File>>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<File>>),
}

impl ContainerReader {
    fn new(file: File, compression: Compression) -> io::Result<ContainerReader> {
        let buf = BufReader::new(file);
        Ok(match compression {
            Compression::None => ContainerReader::Plain(buf),
            Compression::Gzip => ContainerReader::Gzip(GzDecoder::new(buf)),
            Compression::Xz => ContainerReader::Xz(XzDecoder::new(buf)),
            Compression::Zstd => {
                ContainerReader::Zstd(zstd::stream::read::Decoder::with_buffer(buf)?)
            }
        })
    }
}

impl Read for ContainerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ContainerReader::Plain(r) => r.read(buf),
            ContainerReader::Gzip(r) => r.read(buf),
            ContainerReader::Xz(r) => r.read(buf),
            ContainerReader::Zstd(r) => r.read(buf),
        }
    }
}

/// Arguments to [`Archive::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Paths to include, relative to `workdir`. Directories are expanded
    /// recursively.
    pub paths: Vec<PathBuf>,
    /// Common base directory in the archive. Defaults to the first
    /// component of the first path.
    pub basedir: Option<PathBuf>,
    /// Directory the input paths are resolved against. Defaults to the
    /// current directory.
    pub workdir: Option<PathBuf>,
    /// Paths to leave out, matched exactly or as a prefix, before
    /// traversal descends into them.
    pub excludes: Vec<PathBuf>,
    /// Explicit compression; inferred from the container suffix when
    /// absent, gzip as the last resort.
    pub compression: Option<Compression>,
    pub dedup: DedupMode,
    pub metadata: Vec<MetadataItem>,
    pub tags: Vec<String>,
}

impl CreateOptions {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> CreateOptions {
        CreateOptions {
            paths: paths.into_iter().collect(),
            basedir: None,
            workdir: None,
            excludes: Vec::new(),
            compression: None,
            dedup: DedupMode::Link,
            metadata: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// An open container plus its parsed manifest.
///
/// The underlying file handle is owned by this value from
/// [`Archive::create`]/[`Archive::open`] until drop; releasing it is tied
/// to scope exit, on success and error paths alike. An `Archive` is not
/// meant to be shared across threads without external synchronization.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    basedir: PathBuf,
    compression: Compression,
    manifest: Manifest,
    file: File,
}

fn is_clean_relative(p: &Path) -> bool {
    !p.as_os_str().is_empty()
        && p.components().all(|c| matches!(c, Component::Normal(_)))
}

fn excluded(path: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|x| path.starts_with(x))
}

fn mtime_to_filetime(mtime: f64) -> FileTime {
    let secs = mtime.floor();
    let nanos = (((mtime - secs) * 1e9).round() as u32).min(999_999_999);
    FileTime::from_unix_time(secs as i64, nanos)
}

fn entry_header(fi: &FileInfo) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(fi.mode);
    header.set_uid(fi.uid as u64);
    header.set_gid(fi.gid as u64);
    header.set_mtime(fi.mtime.max(0.0) as u64);
    if let Some(name) = &fi.uname {
        let _ = header.set_username(name);
    }
    if let Some(name) = &fi.gname {
        let _ = header.set_groupname(name);
    }
    header
}

impl Archive {
    /// Walk the requested paths, build the manifest (deduplicating
    /// according to `opts.dedup`) and write the container at `path`.
    ///
    /// Unsupported file types are skipped and reported through `warn`;
    /// everything else that goes wrong aborts creation.
    pub fn create(
        path: &Path,
        opts: CreateOptions,
        warn: &mut dyn FnMut(ArchiveWarning),
    ) -> Result<Archive> {
        if opts.paths.is_empty() {
            return Err(ArchiveError::InvalidArgument(
                "refusing to create an empty archive".into(),
            ));
        }
        let workdir = opts.workdir.clone().unwrap_or_else(|| PathBuf::from("."));

        for p in opts.paths.iter().chain(&opts.excludes) {
            if !is_clean_relative(p) {
                return Err(ArchiveError::InvalidArgument(format!(
                    "invalid path '{}': must be relative and normalized",
                    p.display()
                )));
            }
        }
        let basedir = match &opts.basedir {
            Some(b) => b.clone(),
            None => {
                let head = opts.paths[0].components().next().expect("checked non-empty");
                PathBuf::from(head.as_os_str())
            }
        };
        if !is_clean_relative(&basedir) {
            return Err(ArchiveError::InvalidArgument(format!(
                "invalid base directory '{}': must be relative and normalized",
                basedir.display()
            )));
        }
        for p in opts.paths.iter().chain(&opts.excludes) {
            if !p.starts_with(&basedir) {
                return Err(ArchiveError::InvalidArgument(format!(
                    "invalid path '{}': must be a subpath of base directory '{}'",
                    p.display(),
                    basedir.display()
                )));
            }
        }

        debug!(archive = %path.display(), dedup = %opts.dedup, "creating archive");
        let entries = Self::collect_entries(&workdir, &opts, warn)?;
        let manifest = Manifest::new(entries, opts.tags.clone(), opts.metadata.clone())?;

        if let Some(fi) = manifest.find(&basedir) {
            if !fi.is_dir() {
                return Err(ArchiveError::InvalidArgument(format!(
                    "base directory '{}' must be a directory",
                    basedir.display()
                )));
            }
        }
        let member_name = basedir.join(MANIFEST_NAME);
        if manifest.find(&member_name).is_some() {
            return Err(ArchiveError::InvalidArgument(format!(
                "invalid path '{}': this filename is reserved",
                member_name.display()
            )));
        }

        let compression = opts
            .compression
            .or_else(|| Compression::from_suffix(path))
            .unwrap_or(Compression::Gzip);

        let out = File::create(path).map_err(ArchiveError::io(path))?;
        let mut builder = Builder::new(ContainerWriter::new(out, compression)?);
        builder.follow_symlinks(false);
        Self::write_members(&mut builder, &manifest, &member_name, &workdir)?;
        let file = builder.into_inner()?.finish()?;
        drop(file);

        let abs = path.canonicalize().map_err(ArchiveError::io(path))?;
        let file = File::open(&abs).map_err(ArchiveError::io(&abs))?;
        Ok(Archive { path: abs, basedir, compression, manifest, file })
    }

    fn collect_entries(
        workdir: &Path,
        opts: &CreateOptions,
        warn: &mut dyn FnMut(ArchiveWarning),
    ) -> Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut dupindex = DedupIndex::new(opts.dedup);

        for p in &opts.paths {
            if excluded(p, &opts.excludes) {
                continue;
            }
            let fs_root = workdir.join(p);
            if let Err(e) = fs::symlink_metadata(&fs_root) {
                if e.kind() == io::ErrorKind::NotFound {
                    return Err(ArchiveError::NotFound { path: p.clone() });
                }
                return Err(ArchiveError::io(&fs_root)(e));
            }

            let base = p.clone();
            let root = fs_root.clone();
            let excludes = opts.excludes.clone();
            let walker = WalkDir::new(&fs_root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(move |e| {
                    let arc = match e.path().strip_prefix(&root) {
                        Ok(rel) => base.join(rel),
                        Err(_) => return false,
                    };
                    !excluded(&arc, &excludes)
                });

            for entry in walker {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    match e.into_io_error() {
                        Some(source) => ArchiveError::Io { source, path },
                        None => ArchiveError::InvalidArgument(format!(
                            "file system loop at '{}'",
                            path.display()
                        )),
                    }
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(&fs_root)
                    .expect("walkdir stays below its root");
                // For the walk root itself rel is empty; joining it would
                // leave a trailing separator in the recorded path.
                let arc = if rel.as_os_str().is_empty() { p.clone() } else { p.join(rel) };
                if !seen.insert(arc.clone()) {
                    return Err(ArchiveError::InvalidArgument(format!(
                        "duplicate path '{}'",
                        arc.display()
                    )));
                }

                let mut fi = FileInfo::from_path(arc, entry.path())?;
                if fi.is_other() {
                    warn(ArchiveWarning::UnsupportedType { path: fi.path().to_path_buf() });
                    continue;
                }
                if fi.is_file() {
                    let meta = fs::symlink_metadata(entry.path())
                        .map_err(ArchiveError::io(entry.path()))?;
                    if let Some(target) = dupindex.check(&fi, &meta)? {
                        fi = fi.into_hard_link(target);
                    }
                }
                entries.push(fi);
            }
        }
        Ok(entries)
    }

    fn write_members(
        builder: &mut Builder<ContainerWriter>,
        manifest: &Manifest,
        member_name: &Path,
        workdir: &Path,
    ) -> Result<()> {
        // The manifest is the logically-first member; serializing it here
        // forces any still-lazy checksums.
        let mut doc = Vec::new();
        manifest.write(&mut doc)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o444);
        header.set_size(doc.len() as u64);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        builder.append_data(&mut header, member_name, doc.as_slice())?;

        for fi in manifest.iter() {
            let mut header = entry_header(fi);
            match fi.file_type() {
                FileType::File => {
                    let fs_path = workdir.join(fi.path());
                    let size = fi.size().unwrap_or(0);
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(size);
                    let f = File::open(&fs_path).map_err(ArchiveError::io(&fs_path))?;
                    builder.append_data(&mut header, fi.path(), f)?;
                }
                FileType::Dir => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, fi.path(), io::empty())?;
                }
                FileType::Symlink => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    let target = fi.target().expect("symlink entries carry a target");
                    builder.append_link(&mut header, fi.path(), target)?;
                }
                FileType::Link => {
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    let target = fi.target().expect("hard link entries carry a target");
                    builder.append_link(&mut header, fi.path(), target)?;
                }
                FileType::Other => {
                    // Skipped during traversal; a manifest never holds one.
                    unreachable!("unsupported entry type in manifest")
                }
            }
        }
        Ok(())
    }

    /// Open an existing container, parsing the first member as the
    /// manifest and keeping the handle open for later member access.
    pub fn open(path: &Path) -> Result<Archive> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ArchiveError::NotFound { path: path.to_path_buf() }
            } else {
                ArchiveError::io(path)(e)
            }
        })?;
        let compression = Compression::sniff(&mut file).map_err(ArchiveError::io(path))?;

        let reader = ContainerReader::new(file.try_clone().map_err(ArchiveError::io(path))?, compression)?;
        let mut container = tar::Archive::new(reader);
        let mut members = container
            .entries()
            .map_err(|e| ArchiveError::Format(format!("cannot read archive: {}", e)))?;
        let first = members
            .next()
            .ok_or_else(|| ArchiveError::Format("archive has no members".into()))?
            .map_err(|e| ArchiveError::Format(format!("cannot read archive: {}", e)))?;
        let member_path = first
            .path()
            .map_err(|e| ArchiveError::Format(format!("cannot read archive: {}", e)))?
            .into_owned();
        if member_path.file_name().and_then(|n| n.to_str()) != Some(MANIFEST_NAME) {
            return Err(ArchiveError::Format(format!(
                "first member '{}' is not a manifest",
                member_path.display()
            )));
        }
        let basedir = member_path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        let manifest = Manifest::parse(first)?;
        debug!(archive = %path.display(), entries = manifest.len(), "opened archive");

        let abs = path.canonicalize().map_err(ArchiveError::io(path))?;
        Ok(Archive { path: abs, basedir, compression, manifest, file })
    }

    /// Absolute path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base directory all manifest paths live under.
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Release the underlying handle. Dropping the `Archive` has the same
    /// effect; this form makes the release point explicit.
    pub fn close(self) {}

    fn member_name(&self) -> PathBuf {
        self.basedir.join(MANIFEST_NAME)
    }

    /// A fresh sequential reader over the container members, starting at
    /// the first member.
    fn reader(&self) -> Result<tar::Archive<ContainerReader>> {
        let mut f = self.file.try_clone().map_err(ArchiveError::io(&self.path))?;
        f.seek(SeekFrom::Start(0)).map_err(ArchiveError::io(&self.path))?;
        Ok(tar::Archive::new(ContainerReader::new(f, self.compression)?))
    }

    /// Check every manifest entry against the stored members.
    ///
    /// Returns the accumulated findings rather than failing on the first
    /// one; an empty list means the archive is intact. Whether any failure
    /// is fatal is the caller's decision.
    pub fn verify(&self) -> Result<Vec<VerifyFailure>> {
        let algorithm = self.manifest.algorithm().to_string();
        let member_name = self.member_name();
        let mut findings: HashMap<PathBuf, FailureKind> = HashMap::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        let mut container = self.reader()?;
        for member in container.entries()? {
            let mut member = member?;
            let path = member.path()?.into_owned();
            if path == member_name {
                continue;
            }
            let Some(fi) = self.manifest.find(&path) else {
                continue;
            };
            seen.insert(path.clone());
            let etype = member.header().entry_type();
            let failure = match fi.file_type() {
                FileType::File => {
                    if etype != EntryType::Regular {
                        Some(FailureKind::TypeMismatch)
                    } else {
                        let stored = checksum::digest(&algorithm, &mut member)?;
                        let want = fi.checksum_with(&algorithm)?;
                        (stored != *want).then_some(FailureKind::ChecksumMismatch)
                    }
                }
                FileType::Dir => {
                    (etype != EntryType::Directory).then_some(FailureKind::TypeMismatch)
                }
                FileType::Symlink => Self::check_link(&member, fi, EntryType::Symlink)?,
                FileType::Link => {
                    let target_ok = fi
                        .target()
                        .and_then(|t| self.manifest.find(t))
                        .map(|t| t.is_file())
                        .unwrap_or(false);
                    if !target_ok {
                        Some(FailureKind::LinkTargetMismatch)
                    } else {
                        Self::check_link(&member, fi, EntryType::Link)?
                    }
                }
                FileType::Other => Some(FailureKind::TypeMismatch),
            };
            if let Some(kind) = failure {
                findings.insert(path, kind);
            }
        }

        let mut failures = Vec::new();
        for fi in self.manifest.iter() {
            if !seen.contains(fi.path()) {
                failures.push(VerifyFailure {
                    path: fi.path().to_path_buf(),
                    kind: FailureKind::Missing,
                });
            } else if let Some(kind) = findings.remove(fi.path()) {
                failures.push(VerifyFailure { path: fi.path().to_path_buf(), kind });
            }
        }
        Ok(failures)
    }

    fn check_link(
        member: &tar::Entry<'_, ContainerReader>,
        fi: &FileInfo,
        expected: EntryType,
    ) -> Result<Option<FailureKind>> {
        if member.header().entry_type() != expected {
            return Ok(Some(FailureKind::TypeMismatch));
        }
        let stored = member.link_name()?;
        let matches = match (stored, fi.target()) {
            (Some(s), Some(t)) => s == t,
            _ => false,
        };
        Ok((!matches).then_some(FailureKind::LinkTargetMismatch))
    }

    /// Extract the whole archive under `targetdir`, restoring mode,
    /// ownership (best-effort) and modification times.
    pub fn extract(&self, targetdir: &Path) -> Result<()> {
        fs::create_dir_all(targetdir).map_err(ArchiveError::io(targetdir))?;
        debug!(archive = %self.path.display(), target = %targetdir.display(), "extracting");

        // Directories and symbolic links are fully described by the
        // manifest; only file bodies need the container stream.
        let mut dirstack: Vec<&FileInfo> = Vec::new();
        for fi in self.manifest.iter() {
            let dest = targetdir.join(fi.path());
            match fi.file_type() {
                FileType::Dir => {
                    fs::create_dir_all(&dest).map_err(ArchiveError::io(&dest))?;
                    dirstack.push(fi);
                }
                FileType::Symlink => {
                    ensure_parent(&dest)?;
                    let target = fi.target().expect("symlink entries carry a target");
                    std::os::unix::fs::symlink(target, &dest)
                        .map_err(ArchiveError::io(&dest))?;
                    restore_symlink_attrs(&dest, fi)?;
                }
                _ => {}
            }
        }

        let member_name = self.member_name();
        let mut extracted: HashSet<PathBuf> = HashSet::new();
        let mut container = self.reader()?;
        for member in container.entries()? {
            let mut member = member?;
            let path = member.path()?.into_owned();
            if path == member_name {
                continue;
            }
            let Some(fi) = self.manifest.find(&path) else {
                continue;
            };
            let dest = targetdir.join(&path);
            match fi.file_type() {
                FileType::File => {
                    ensure_parent(&dest)?;
                    let mut out = File::create(&dest).map_err(ArchiveError::io(&dest))?;
                    io::copy(&mut member, &mut out).map_err(ArchiveError::io(&dest))?;
                    drop(out);
                    restore_attrs(&dest, fi)?;
                    extracted.insert(path);
                }
                FileType::Link => {
                    ensure_parent(&dest)?;
                    let target = fi.target().expect("hard link entries carry a target");
                    fs::hard_link(targetdir.join(target), &dest)
                        .map_err(ArchiveError::io(&dest))?;
                    extracted.insert(path);
                }
                _ => {}
            }
        }

        for fi in self.manifest.iter() {
            if matches!(fi.file_type(), FileType::File | FileType::Link)
                && !extracted.contains(fi.path())
            {
                return Err(ArchiveError::NotFound { path: fi.path().to_path_buf() });
            }
        }

        // Directory attributes last, children before parents, so writing
        // the content does not clobber the restored mtimes.
        for fi in dirstack.into_iter().rev() {
            restore_attrs(&targetdir.join(fi.path()), fi)?;
        }
        Ok(())
    }

    /// Extract a single member to `targetdir`.
    ///
    /// Fails with [`ArchiveError::NotFound`] if the path is not in the
    /// manifest. A hard-link member is linked against an already-extracted
    /// target when present, otherwise its resolved content is written out.
    pub fn extract_member(&self, member: &Path, targetdir: &Path) -> Result<()> {
        let fi = self
            .manifest
            .find(member)
            .ok_or_else(|| ArchiveError::NotFound { path: member.to_path_buf() })?;
        fs::create_dir_all(targetdir).map_err(ArchiveError::io(targetdir))?;
        let dest = targetdir.join(fi.path());
        ensure_parent(&dest)?;

        match fi.file_type() {
            FileType::Dir => {
                fs::create_dir_all(&dest).map_err(ArchiveError::io(&dest))?;
                restore_attrs(&dest, fi)?;
            }
            FileType::Symlink => {
                let target = fi.target().expect("symlink entries carry a target");
                std::os::unix::fs::symlink(target, &dest).map_err(ArchiveError::io(&dest))?;
                restore_symlink_attrs(&dest, fi)?;
            }
            FileType::File => {
                self.copy_member_content(fi.path(), &dest)?;
                restore_attrs(&dest, fi)?;
            }
            FileType::Link => {
                let target = fi.target().ok_or_else(|| {
                    ArchiveError::CorruptManifest(format!(
                        "entry '{}': missing hard link target",
                        fi.path().display()
                    ))
                })?;
                let linked = targetdir.join(target);
                if linked.exists() {
                    fs::hard_link(&linked, &dest).map_err(ArchiveError::io(&dest))?;
                } else {
                    self.copy_member_content(target, &dest)?;
                    restore_attrs(&dest, fi)?;
                }
            }
            FileType::Other => {
                return Err(ArchiveError::CorruptManifest(format!(
                    "entry '{}': invalid entry type",
                    fi.path().display()
                )))
            }
        }
        Ok(())
    }

    fn copy_member_content(&self, member: &Path, dest: &Path) -> Result<()> {
        let mut container = self.reader()?;
        for candidate in container.entries()? {
            let mut candidate = candidate?;
            if candidate.path()?.as_ref() == member {
                let mut out = File::create(dest).map_err(ArchiveError::io(dest))?;
                io::copy(&mut candidate, &mut out).map_err(ArchiveError::io(dest))?;
                return Ok(());
            }
        }
        Err(ArchiveError::NotFound { path: member.to_path_buf() })
    }

    /// Attach a metadata item and persist it by rewriting the container.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.manifest.add_metadata(key, value);
        self.rewrite()
    }

    /// The value of a metadata item, or [`ArchiveError::MetadataNotFound`].
    pub fn get_metadata(&self, key: &str) -> Result<&str> {
        self.manifest
            .get_metadata(key)
            .ok_or_else(|| ArchiveError::MetadataNotFound(key.to_string()))
    }

    /// Attach a tag to the archive and persist it.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> Result<()> {
        self.manifest.add_tag(tag);
        self.rewrite()
    }

    /// Write a new container with the current manifest and the existing
    /// member bodies, then atomically replace the old one. Manifest
    /// mutation never happens in place.
    fn rewrite(&mut self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir).map_err(ArchiveError::io(dir))?;
        let out = tmp.reopen().map_err(ArchiveError::io(tmp.path()))?;

        let member_name = self.member_name();
        let mut builder = Builder::new(ContainerWriter::new(out, self.compression)?);
        let mut doc = Vec::new();
        self.manifest.write(&mut doc)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o444);
        header.set_size(doc.len() as u64);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        builder.append_data(&mut header, &member_name, doc.as_slice())?;

        let mut container = self.reader()?;
        for member in container.entries()? {
            let mut member = member?;
            let path = member.path()?.into_owned();
            if path == member_name {
                continue;
            }
            let mut header = member.header().clone();
            match header.entry_type() {
                EntryType::Symlink | EntryType::Link => {
                    let target = member.link_name()?.ok_or_else(|| {
                        ArchiveError::Format(format!(
                            "member '{}': link without target",
                            path.display()
                        ))
                    })?;
                    let target = target.into_owned();
                    builder.append_link(&mut header, &path, &target)?;
                }
                _ => {
                    builder.append_data(&mut header, &path, &mut member)?;
                }
            }
        }
        builder.into_inner()?.finish()?;

        tmp.persist(&self.path)
            .map_err(|e| ArchiveError::Io { source: e.error, path: self.path.clone() })?;
        self.file = File::open(&self.path).map_err(ArchiveError::io(&self.path))?;
        Ok(())
    }
}

fn ensure_parent(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
    }
    Ok(())
}

fn restore_attrs(path: &Path, fi: &FileInfo) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(fi.mode))
        .map_err(ArchiveError::io(path))?;
    // Ownership restoration only works for root; ignore failures.
    let _ = std::os::unix::fs::chown(path, Some(fi.uid), Some(fi.gid));
    filetime::set_file_mtime(path, mtime_to_filetime(fi.mtime)).map_err(ArchiveError::io(path))?;
    Ok(())
}

fn restore_symlink_attrs(path: &Path, fi: &FileInfo) -> Result<()> {
    let _ = std::os::unix::fs::lchown(path, Some(fi.uid), Some(fi.gid));
    let t = mtime_to_filetime(fi.mtime);
    filetime::set_symlink_file_times(path, t, t).map_err(ArchiveError::io(path))?;
    Ok(())
}
