//! The diff engine: compare a manifest against a live directory tree or
//! against another manifest, producing one verdict per path.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::checksum;
use crate::error::{ArchiveError, Result};
use crate::fileinfo::{FileInfo, FileType};
use crate::manifest::Manifest;

/// Options controlling what a diff reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Also report entries whose content is identical but whose
    /// mode/owner/mtime differ.
    pub report_meta: bool,
    /// When comparing against a live tree, do not descend into manifest
    /// directories that themselves differ: the directory's own verdict is
    /// still reported, its children are not compared. Manifest-to-manifest
    /// comparison ignores this option.
    pub skip_dir_content: bool,
    /// Report paths present in the reference but absent from the manifest.
    pub report_added: bool,
}

/// Per-path classification, strongest difference first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffVerdict {
    /// In the manifest, absent from the reference.
    Missing,
    /// In the reference, absent from the manifest.
    Added,
    /// Same path, different entry type.
    TypeChanged,
    /// Regular files with differing content.
    ContentChanged,
    /// Symbolic links pointing at different targets.
    TargetChanged,
    /// Same type and content, different mode/owner/mtime.
    MetadataChanged,
    Unchanged,
}

impl std::fmt::Display for DiffVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiffVerdict::Missing => "missing",
            DiffVerdict::Added => "added",
            DiffVerdict::TypeChanged => "type changed",
            DiffVerdict::ContentChanged => "content changed",
            DiffVerdict::TargetChanged => "symlink target changed",
            DiffVerdict::MetadataChanged => "metadata changed",
            DiffVerdict::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// One line of a diff report.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub verdict: DiffVerdict,
}

fn live_type(ft: fs::FileType) -> FileType {
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

fn meta_differs(fi: &FileInfo, meta: &fs::Metadata) -> bool {
    let live_mtime = meta.mtime() as f64 + meta.mtime_nsec() as f64 * 1e-9;
    fi.mode != meta.mode() & 0o7777
        || fi.uid != meta.uid()
        || fi.gid != meta.gid()
        || fi.mtime != live_mtime
}

/// Compare a manifest against the live tree under `root` (the directory
/// the archive's paths were recorded relative to, i.e. the creation-time
/// work directory).
///
/// Verdicts come in manifest entry order so results are reproducible; any
/// added paths follow, in traversal order. Checksums of live files are
/// computed on demand, only when path and type already match.
pub fn diff_tree(manifest: &Manifest, root: &Path, opts: &DiffOptions) -> Result<Vec<DiffEntry>> {
    debug!(root = %root.display(), entries = manifest.len(), "diffing against file system");
    let mut out = Vec::with_capacity(manifest.len());
    let mut skipped: Vec<PathBuf> = Vec::new();
    let mut skip_prefix: Option<PathBuf> = None;

    for fi in manifest.iter() {
        if let Some(prefix) = &skip_prefix {
            if fi.path().starts_with(prefix) {
                continue;
            }
            skip_prefix = None;
        }
        let verdict = classify_against_tree(manifest, fi, root, opts)?;
        out.push(DiffEntry { path: fi.path().to_path_buf(), verdict });
        // A directory that differs gets its own verdict reported, but its
        // children are not compared; unchanged directories are descended
        // into normally.
        if opts.skip_dir_content && fi.is_dir() && verdict != DiffVerdict::Unchanged {
            skip_prefix = Some(fi.path().to_path_buf());
            skipped.push(fi.path().to_path_buf());
        }
    }

    if opts.report_added {
        collect_added(manifest, root, &skipped, &mut out)?;
    }
    Ok(out)
}

fn classify_against_tree(
    manifest: &Manifest,
    fi: &FileInfo,
    root: &Path,
    opts: &DiffOptions,
) -> Result<DiffVerdict> {
    let fs_path = root.join(fi.path());
    let meta = match fs::symlink_metadata(&fs_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DiffVerdict::Missing),
        Err(e) => return Err(ArchiveError::io(&fs_path)(e)),
    };

    // A hard-link entry materializes as a regular file on disk.
    let want_type = if fi.is_link() { FileType::File } else { fi.file_type() };
    if live_type(meta.file_type()) != want_type {
        return Ok(DiffVerdict::TypeChanged);
    }

    match want_type {
        FileType::File => {
            let want = manifest.checksum_of(fi)?;
            let live = checksum::digest_file(&want.algorithm, &fs_path)?;
            if live != *want {
                return Ok(DiffVerdict::ContentChanged);
            }
        }
        FileType::Symlink => {
            let live_target = fs::read_link(&fs_path).map_err(ArchiveError::io(&fs_path))?;
            if Some(live_target.as_path()) != fi.target() {
                return Ok(DiffVerdict::TargetChanged);
            }
        }
        _ => {}
    }

    if opts.report_meta && meta_differs(fi, &meta) {
        return Ok(DiffVerdict::MetadataChanged);
    }
    Ok(DiffVerdict::Unchanged)
}

fn collect_added(
    manifest: &Manifest,
    root: &Path,
    skipped: &[PathBuf],
    out: &mut Vec<DiffEntry>,
) -> Result<()> {
    let Some(basedir) = manifest.basedir() else {
        return Ok(());
    };
    let fs_base = root.join(basedir);
    if fs::symlink_metadata(&fs_base).is_err() {
        return Ok(());
    }
    let walker = WalkDir::new(&fs_base)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = match e.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => return false,
            };
            // Directories whose children were not compared are out of
            // scope for the added scan as well.
            !skipped.iter().any(|p| rel.starts_with(p))
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
            .strip_prefix(root)
            .expect("walkdir stays below the root");
        if manifest.find(rel).is_none() {
            out.push(DiffEntry { path: rel.to_path_buf(), verdict: DiffVerdict::Added });
        }
    }
    Ok(())
}

fn rel_path<'a>(fi: &'a FileInfo, basedir: Option<&Path>) -> &'a Path {
    match basedir {
        Some(base) => fi.path().strip_prefix(base).unwrap_or_else(|_| fi.path()),
        None => fi.path(),
    }
}

/// Compare two manifests entry by entry.
///
/// Paths are compared relative to each manifest's base directory so two
/// archives of the same tree under different base names line up. Both
/// sides are walked in canonical path order.
pub fn diff_manifests(
    ours: &Manifest,
    theirs: &Manifest,
    opts: &DiffOptions,
) -> Result<Vec<DiffEntry>> {
    if ours.algorithm() != theirs.algorithm() {
        return Err(ArchiveError::Format(
            "no common checksum algorithm, cannot compare archive content".into(),
        ));
    }
    let our_base = ours.basedir().map(Path::to_path_buf);
    let their_base = theirs.basedir().map(Path::to_path_buf);

    let mut a: Vec<&FileInfo> = ours.iter().collect();
    let mut b: Vec<&FileInfo> = theirs.iter().collect();
    a.sort_by(|x, y| rel_path(x, our_base.as_deref()).cmp(rel_path(y, our_base.as_deref())));
    b.sort_by(|x, y| rel_path(x, their_base.as_deref()).cmp(rel_path(y, their_base.as_deref())));

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let pa = rel_path(a[i], our_base.as_deref());
        let pb = rel_path(b[j], their_base.as_deref());
        match pa.cmp(pb) {
            Ordering::Less => {
                out.push(DiffEntry { path: pa.to_path_buf(), verdict: DiffVerdict::Missing });
                i += 1;
            }
            Ordering::Greater => {
                if opts.report_added {
                    out.push(DiffEntry { path: pb.to_path_buf(), verdict: DiffVerdict::Added });
                }
                j += 1;
            }
            Ordering::Equal => {
                let verdict = classify_pair(ours, a[i], theirs, b[j])?;
                let verdict = match verdict {
                    DiffVerdict::Unchanged if opts.report_meta && pair_meta_differs(a[i], b[j]) => {
                        DiffVerdict::MetadataChanged
                    }
                    v => v,
                };
                out.push(DiffEntry { path: pa.to_path_buf(), verdict });
                i += 1;
                j += 1;
            }
        }
    }
    for fi in &a[i..] {
        out.push(DiffEntry {
            path: rel_path(fi, our_base.as_deref()).to_path_buf(),
            verdict: DiffVerdict::Missing,
        });
    }
    if opts.report_added {
        for fi in &b[j..] {
            out.push(DiffEntry {
                path: rel_path(fi, their_base.as_deref()).to_path_buf(),
                verdict: DiffVerdict::Added,
            });
        }
    }
    Ok(out)
}

fn pair_meta_differs(a: &FileInfo, b: &FileInfo) -> bool {
    a.mode != b.mode || a.uid != b.uid || a.gid != b.gid || a.mtime != b.mtime
}

fn classify_pair(
    ours: &Manifest,
    a: &FileInfo,
    theirs: &Manifest,
    b: &FileInfo,
) -> Result<DiffVerdict> {
    // Hard links count as regular files; dedup must not show up as a
    // difference between two archives of the same tree.
    let norm = |fi: &FileInfo| {
        if fi.is_link() {
            FileType::File
        } else {
            fi.file_type()
        }
    };
    if norm(a) != norm(b) {
        return Ok(DiffVerdict::TypeChanged);
    }
    match norm(a) {
        FileType::File => {
            if ours.checksum_of(a)? != theirs.checksum_of(b)? {
                return Ok(DiffVerdict::ContentChanged);
            }
        }
        FileType::Symlink => {
            if a.target() != b.target() {
                return Ok(DiffVerdict::TargetChanged);
            }
        }
        _ => {}
    }
    Ok(DiffVerdict::Unchanged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, CreateOptions};
    use std::fs;
    use tempfile::tempdir;

    fn no_warn() -> impl FnMut(crate::error::ArchiveWarning) {
        |w| panic!("unexpected warning: {}", w)
    }

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("base/sub")).unwrap();
        fs::write(root.join("base/a.txt"), b"alpha\n").unwrap();
        fs::write(root.join("base/sub/b.txt"), b"bravo\n").unwrap();
        std::os::unix::fs::symlink("a.txt", root.join("base/link")).unwrap();
    }

    fn archive_of(root: &Path) -> Archive {
        let mut opts = CreateOptions::new([PathBuf::from("base")]);
        opts.workdir = Some(root.to_path_buf());
        Archive::create(&root.join("test.tar.gz"), opts, &mut no_warn()).unwrap()
    }

    #[test]
    fn unchanged_tree_diffs_clean() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        assert_eq!(report.len(), archive.manifest().len());
        assert!(report.iter().all(|d| d.verdict == DiffVerdict::Unchanged));
    }

    #[test]
    fn content_change_is_detected_and_reverts() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::write(tmp.path().join("base/a.txt"), b"changed\n").unwrap();
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::ContentChanged);

        fs::write(tmp.path().join("base/a.txt"), b"alpha\n").unwrap();
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::Unchanged);
    }

    #[test]
    fn metadata_change_needs_report_meta() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        let target = tmp.path().join("base/a.txt");
        fs::set_permissions(&target, fs::Permissions::from_mode(0o600)).unwrap();

        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::Unchanged);

        let opts = DiffOptions { report_meta: true, ..Default::default() };
        let report = diff_tree(archive.manifest(), tmp.path(), &opts).unwrap();
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::MetadataChanged);
    }

    #[test]
    fn missing_and_added_paths() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::remove_file(tmp.path().join("base/sub/b.txt")).unwrap();
        fs::write(tmp.path().join("base/new.txt"), b"fresh\n").unwrap();

        let opts = DiffOptions { report_added: true, ..Default::default() };
        let report = diff_tree(archive.manifest(), tmp.path(), &opts).unwrap();
        let b = report.iter().find(|d| d.path == Path::new("base/sub/b.txt")).unwrap();
        assert_eq!(b.verdict, DiffVerdict::Missing);
        let added = report.iter().find(|d| d.path == Path::new("base/new.txt")).unwrap();
        assert_eq!(added.verdict, DiffVerdict::Added);
        // One-directional check stays silent about additions.
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        assert!(report.iter().all(|d| d.path != Path::new("base/new.txt")));
    }

    #[test]
    fn type_change_beats_content() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::remove_file(tmp.path().join("base/a.txt")).unwrap();
        fs::create_dir(tmp.path().join("base/a.txt")).unwrap();
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::TypeChanged);
    }

    #[test]
    fn skip_dir_content_still_compares_the_directory_itself() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        // Change a child and the directory's own mode.
        fs::write(tmp.path().join("base/sub/b.txt"), b"changed\n").unwrap();
        fs::set_permissions(tmp.path().join("base/sub"), fs::Permissions::from_mode(0o700))
            .unwrap();

        let opts = DiffOptions {
            report_meta: true,
            skip_dir_content: true,
            ..Default::default()
        };
        let report = diff_tree(archive.manifest(), tmp.path(), &opts).unwrap();
        // The child is not compared at all...
        assert!(report.iter().all(|d| d.path != Path::new("base/sub/b.txt")));
        // ...but the directory's own metadata comparison still happens.
        let sub = report.iter().find(|d| d.path == Path::new("base/sub")).unwrap();
        assert_eq!(sub.verdict, DiffVerdict::MetadataChanged);
        // Entries outside the skipped directory are still compared; the
        // unchanged base directory never suppresses the rest of the tree.
        let a = report.iter().find(|d| d.path == Path::new("base/a.txt")).unwrap();
        assert_eq!(a.verdict, DiffVerdict::Unchanged);
    }

    #[test]
    fn skip_dir_content_descends_into_unchanged_directories() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::write(tmp.path().join("base/sub/b.txt"), b"changed\n").unwrap();

        let opts = DiffOptions { skip_dir_content: true, ..Default::default() };
        let report = diff_tree(archive.manifest(), tmp.path(), &opts).unwrap();
        // The directory itself matches, so its children are compared.
        let sub = report.iter().find(|d| d.path == Path::new("base/sub")).unwrap();
        assert_eq!(sub.verdict, DiffVerdict::Unchanged);
        let b = report.iter().find(|d| d.path == Path::new("base/sub/b.txt")).unwrap();
        assert_eq!(b.verdict, DiffVerdict::ContentChanged);
    }

    #[test]
    fn skip_dir_content_suppresses_children_of_missing_directories() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::remove_dir_all(tmp.path().join("base/sub")).unwrap();

        let opts = DiffOptions { skip_dir_content: true, ..Default::default() };
        let report = diff_tree(archive.manifest(), tmp.path(), &opts).unwrap();
        let sub = report.iter().find(|d| d.path == Path::new("base/sub")).unwrap();
        assert_eq!(sub.verdict, DiffVerdict::Missing);
        assert!(report.iter().all(|d| d.path != Path::new("base/sub/b.txt")));
        // Without the option every lost path is reported individually.
        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let b = report.iter().find(|d| d.path == Path::new("base/sub/b.txt")).unwrap();
        assert_eq!(b.verdict, DiffVerdict::Missing);
    }

    #[test]
    fn symlink_retarget_has_its_own_verdict() {
        let tmp = tempdir().unwrap();
        sample_tree(tmp.path());
        let archive = archive_of(tmp.path());

        fs::remove_file(tmp.path().join("base/link")).unwrap();
        std::os::unix::fs::symlink("sub/b.txt", tmp.path().join("base/link")).unwrap();

        let report =
            diff_tree(archive.manifest(), tmp.path(), &DiffOptions::default()).unwrap();
        let link = report.iter().find(|d| d.path == Path::new("base/link")).unwrap();
        assert_eq!(link.verdict, DiffVerdict::TargetChanged);

        let mut opts = CreateOptions::new([PathBuf::from("base")]);
        opts.workdir = Some(tmp.path().to_path_buf());
        let second =
            Archive::create(&tmp.path().join("second.tar.gz"), opts, &mut no_warn()).unwrap();
        let report = diff_manifests(
            archive.manifest(),
            second.manifest(),
            &DiffOptions::default(),
        )
        .unwrap();
        let link = report.iter().find(|d| d.path == Path::new("link")).unwrap();
        assert_eq!(link.verdict, DiffVerdict::TargetChanged);
    }

    #[test]
    fn manifest_diff_ignores_dedup_differences() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("base")).unwrap();
        fs::write(tmp.path().join("base/one.txt"), b"same body").unwrap();
        fs::write(tmp.path().join("base/two.txt"), b"same body").unwrap();

        let mut opts = CreateOptions::new([PathBuf::from("base")]);
        opts.workdir = Some(tmp.path().to_path_buf());
        opts.dedup = crate::dedup::DedupMode::Never;
        let plain =
            Archive::create(&tmp.path().join("plain.tar.gz"), opts.clone(), &mut no_warn())
                .unwrap();
        opts.dedup = crate::dedup::DedupMode::Content;
        let deduped =
            Archive::create(&tmp.path().join("dedup.tar.gz"), opts, &mut no_warn()).unwrap();

        let report = diff_manifests(
            plain.manifest(),
            deduped.manifest(),
            &DiffOptions { report_added: true, ..Default::default() },
        )
        .unwrap();
        assert!(report.iter().all(|d| d.verdict == DiffVerdict::Unchanged));
    }

    #[test]
    fn manifest_diff_reports_both_directions() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("base")).unwrap();
        fs::write(tmp.path().join("base/keep.txt"), b"kept").unwrap();
        fs::write(tmp.path().join("base/old.txt"), b"old").unwrap();
        let mut opts = CreateOptions::new([PathBuf::from("base")]);
        opts.workdir = Some(tmp.path().to_path_buf());
        let first =
            Archive::create(&tmp.path().join("first.tar.gz"), opts.clone(), &mut no_warn())
                .unwrap();

        fs::remove_file(tmp.path().join("base/old.txt")).unwrap();
        fs::write(tmp.path().join("base/new.txt"), b"new").unwrap();
        let second =
            Archive::create(&tmp.path().join("second.tar.gz"), opts, &mut no_warn()).unwrap();

        let report = diff_manifests(
            first.manifest(),
            second.manifest(),
            &DiffOptions { report_added: true, ..Default::default() },
        )
        .unwrap();
        let old = report.iter().find(|d| d.path == Path::new("old.txt")).unwrap();
        assert_eq!(old.verdict, DiffVerdict::Missing);
        let new = report.iter().find(|d| d.path == Path::new("new.txt")).unwrap();
        assert_eq!(new.verdict, DiffVerdict::Added);
        let keep = report.iter().find(|d| d.path == Path::new("keep.txt")).unwrap();
        assert_eq!(keep.verdict, DiffVerdict::Unchanged);

        // Swapping the sides swaps the verdicts, including the entries one
        // manifest has left over after the other is exhausted.
        let report = diff_manifests(
            second.manifest(),
            first.manifest(),
            &DiffOptions { report_added: true, ..Default::default() },
        )
        .unwrap();
        let new = report.iter().find(|d| d.path == Path::new("new.txt")).unwrap();
        assert_eq!(new.verdict, DiffVerdict::Missing);
        let old = report.iter().find(|d| d.path == Path::new("old.txt")).unwrap();
        assert_eq!(old.verdict, DiffVerdict::Added);
    }
}
