//! Archive signing
//!
//! Injects a signature bundle into a downloaded app archive:
//! - Optional checksum verification of the download
//! - Manifest lookup for the signature target path
//! - Streaming rewrite into a temporary archive
//! - Atomic rename over the original

pub mod bundle;
pub mod checksum;
pub mod manifest;
mod pipeline;
pub mod rewriter;

pub use bundle::{bundle_from_file, load_bundle, merge_account, metadata_plist};
pub use checksum::{verify_file, ChecksumKind};
pub use manifest::ManifestLocation;
pub use pipeline::*;
pub use rewriter::{ArchiveRewriter, RewriteReport};
