//! # tarmeta Core Library
//!
//! This crate creates and reads self-describing archives: ordinary tar
//! containers whose first member is a JSON manifest listing every entry
//! with its attributes and content checksum. The manifest makes an
//! archive verifiable and comparable without trusting the container
//! headers.
//!
//! It is designed to be used by the `tarmeta` command-line application,
//! but its public API can also be used to programmatically create,
//! inspect, verify and extract archives.
//!
//! ## Key Modules
//!
//! - [`archive`]: Creating, opening, verifying and extracting containers.
//! - [`manifest`]: The versioned entry listing with metadata and tags.
//! - [`fileinfo`]: One manifest entry with a lazily computed checksum.
//! - [`checksum`]: Streaming content digests.
//! - [`dedup`]: Duplicate detection at archive creation time.
//! - [`diff`]: Comparing an archive against a live tree or another archive.

pub mod archive;
pub mod checksum;
pub mod cli;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod fileinfo;
pub mod manifest;

pub use error::{ArchiveError, Result};
