//! Streaming archive rewrite
//!
//! Copies every entry of the source archive into a new archive without
//! decompressing it, dropping the two entries that are being replaced, then
//! appends the metadata and signature entries. Blocking; run it on the
//! blocking pool.

use crate::error::IpaError;
use crate::signing::manifest::{self, ManifestLocation};
use ipafetch_types::METADATA_ENTRY_PATH;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Summary of one rewrite pass
#[derive(Debug, Clone)]
pub struct RewriteReport {
    pub location: ManifestLocation,
    pub copied_entries: usize,
    pub replaced_entries: usize,
}

/// Rewrites one archive with injected metadata and signature entries
pub struct ArchiveRewriter {
    source: PathBuf,
}

impl ArchiveRewriter {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Find the manifest and resolve the signature path without rewriting
    pub fn inspect(&self) -> Result<ManifestLocation, IpaError> {
        let mut archive = self.open()?;
        locate_signature(&mut archive)
    }

    /// Write the rewritten archive to `dest`
    ///
    /// `dest` is expected to be a temporary path owned by the caller; on error
    /// it may hold a partial archive that the caller must discard.
    pub fn rewrite(
        &self,
        dest: &Path,
        metadata: &[u8],
        signature: &[u8],
    ) -> Result<RewriteReport, IpaError> {
        let mut archive = self.open()?;
        let location = locate_signature(&mut archive)?;
        info!(
            "Rewriting {:?}: {} entries, signature at {}",
            self.source,
            archive.len(),
            location.signature_path
        );

        let out = File::create(dest)?;
        let mut writer = ZipWriter::new(BufWriter::new(out));
        let mut copied_entries = 0;
        let mut replaced_entries = 0;

        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            let replaced = {
                let name = entry.name();
                name == METADATA_ENTRY_PATH || name == location.signature_path
            };
            if replaced {
                debug!("Dropping replaced entry {}", entry.name());
                replaced_entries += 1;
                continue;
            }
            writer.raw_copy_file(entry)?;
            copied_entries += 1;
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9));

        writer.start_file(METADATA_ENTRY_PATH, options)?;
        writer.write_all(metadata)?;
        writer.start_file(location.signature_path.as_str(), options)?;
        writer.write_all(signature)?;

        let buffered = writer.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|e| IpaError::RewriteFailed(e.to_string()))?;
        file.sync_all()?;

        debug!(
            "Rewrite complete: {} copied, {} replaced",
            copied_entries, replaced_entries
        );
        Ok(RewriteReport {
            location,
            copied_entries,
            replaced_entries,
        })
    }

    fn open(&self) -> Result<ZipArchive<BufReader<File>>, IpaError> {
        let file = File::open(&self.source)?;
        Ok(ZipArchive::new(BufReader::new(file))?)
    }
}

fn locate_signature<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<ManifestLocation, IpaError> {
    let manifest_path = manifest::locate(archive.file_names())
        .map(str::to_string)
        .ok_or_else(|| {
            IpaError::InvalidAppBundle(format!(
                "no <Name>.app/{} entry in archive",
                manifest::MANIFEST_SUBPATH
            ))
        })?;

    let mut content = Vec::new();
    archive.by_name(&manifest_path)?.read_to_end(&mut content)?;
    manifest::resolve(&manifest_path, &content)
}
