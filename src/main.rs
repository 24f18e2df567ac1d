//! Main entry point for the tarmeta CLI app.

use std::process::ExitCode;

use tarmeta::archive::{Archive, CreateOptions};
use tarmeta::cli::{self, Commands, LsFormat};
use tarmeta::diff::{diff_manifests, diff_tree, DiffEntry, DiffOptions, DiffVerdict};
use tarmeta::error::{ArchiveError, Result};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run_app(cli::run()) {
        Ok(status) => ExitCode::from(status),
        Err(ArchiveError::Integrity(failures)) => {
            for failure in &failures {
                eprintln!("{}", failure);
            }
            eprintln!("Error: integrity check failed: {} failure(s)", failures.len());
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_app(command: Commands) -> Result<u8> {
    match command {
        Commands::Create {
            archive,
            paths,
            directory,
            basedir,
            excludes,
            compression,
            deduplicate,
            tags,
        } => {
            let mut opts = CreateOptions::new(paths);
            opts.workdir = directory;
            opts.basedir = basedir;
            opts.excludes = excludes;
            opts.compression = compression;
            opts.dedup = deduplicate;
            opts.tags = tags;
            let mut warn = |w: tarmeta::error::ArchiveWarning| eprintln!("Warning: {}", w);
            Archive::create(&archive, opts, &mut warn)?;
            Ok(0)
        }
        Commands::Verify { archive } => {
            let archive = Archive::open(&archive)?;
            let failures = archive.verify()?;
            if !failures.is_empty() {
                return Err(ArchiveError::Integrity(failures));
            }
            Ok(0)
        }
        Commands::Extract { archive, entries, output } => {
            let archive = Archive::open(&archive)?;
            if entries.is_empty() {
                archive.extract(&output)?;
            } else {
                for entry in &entries {
                    archive.extract_member(entry, &output)?;
                }
            }
            Ok(0)
        }
        Commands::Ls { format, checksum, archive } => {
            let archive = Archive::open(&archive)?;
            let lines = match format {
                LsFormat::Ls => cli::ls_lines(archive.manifest()),
                LsFormat::Checksum => {
                    cli::checksum_lines(archive.manifest(), checksum.as_deref())?
                }
            };
            for line in lines {
                println!("{}", line);
            }
            Ok(0)
        }
        Commands::Info { archive, entry } => {
            let archive = Archive::open(&archive)?;
            let fi = archive
                .manifest()
                .find(&entry)
                .ok_or(ArchiveError::NotFound { path: entry })?;
            for line in cli::info_lines(fi) {
                println!("{}", line);
            }
            Ok(0)
        }
        Commands::Diff { report_meta, archive1, archive2 } => {
            let a1 = Archive::open(&archive1)?;
            let a2 = Archive::open(&archive2)?;
            let opts = DiffOptions { report_meta, report_added: true, ..Default::default() };
            let report = diff_manifests(a1.manifest(), a2.manifest(), &opts)?;
            let mut status = 0;
            for d in &report {
                let p = d.path.display();
                match d.verdict {
                    DiffVerdict::Missing => {
                        println!("Only in {}: {}", a1.path().display(), p);
                    }
                    DiffVerdict::Added => {
                        println!("Only in {}: {}", a2.path().display(), p);
                    }
                    DiffVerdict::TypeChanged => {
                        println!(
                            "Entries {}:{} and {}:{} have different type",
                            a1.path().display(),
                            p,
                            a2.path().display(),
                            p
                        );
                    }
                    DiffVerdict::ContentChanged => {
                        println!(
                            "Files {}:{} and {}:{} differ",
                            a1.path().display(),
                            p,
                            a2.path().display(),
                            p
                        );
                    }
                    DiffVerdict::TargetChanged => {
                        println!(
                            "Symbolic links {}:{} and {}:{} have different target",
                            a1.path().display(),
                            p,
                            a2.path().display(),
                            p
                        );
                    }
                    DiffVerdict::MetadataChanged => {
                        println!(
                            "Entries {}:{} and {}:{} differ in file system metadata",
                            a1.path().display(),
                            p,
                            a2.path().display(),
                            p
                        );
                    }
                    DiffVerdict::Unchanged => {}
                }
                status = status.max(diff_status(d.verdict));
            }
            Ok(status)
        }
        Commands::Check {
            report_meta,
            skip_dir_content,
            report_added,
            directory,
            archive,
        } => {
            let archive = Archive::open(&archive)?;
            let opts = DiffOptions { report_meta, skip_dir_content, report_added };
            let report = diff_tree(archive.manifest(), &directory, &opts)?;
            let mut status = 0;
            for d in report.iter().filter(|d| d.verdict != DiffVerdict::Unchanged) {
                print_check_line(d);
                status = status.max(diff_status(d.verdict));
            }
            Ok(status)
        }
    }
}

/// Exit status of `diff` and `check`: 0 when nothing differs, 101 for
/// content, link target or metadata differences, 102 when entries are
/// missing, added or have changed type.
fn diff_status(verdict: DiffVerdict) -> u8 {
    match verdict {
        DiffVerdict::Unchanged => 0,
        DiffVerdict::ContentChanged
        | DiffVerdict::TargetChanged
        | DiffVerdict::MetadataChanged => 101,
        DiffVerdict::Missing | DiffVerdict::Added | DiffVerdict::TypeChanged => 102,
    }
}

fn print_check_line(d: &DiffEntry) {
    println!("{}: {}", d.verdict, d.path.display());
}
