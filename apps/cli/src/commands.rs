//! CLI command implementations

use crate::output::{field, format_bytes, format_duration, print_output, success};
use crate::progress::TransferProgress;
use crate::{DownloadArgs, OutputFormat, RequestArgs};
use anyhow::{Context, Result};
use console::style;
use ipafetch_core::signing::load_bundle;
use ipafetch_core::IpaFetch;
use ipafetch_types::{DownloadOutcome, DownloadSpec, SignOutcome, SignatureBundle};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

// ============================================================================
// Probe
// ============================================================================

pub async fn probe(
    core: &IpaFetch,
    url: &str,
    request: &RequestArgs,
    format: OutputFormat,
) -> Result<()> {
    let spec = request.apply(DownloadSpec::new(url));
    let info = core
        .probe(&spec)
        .await
        .with_context(|| format!("Failed to probe {}", url))?;

    print_output(&info, format, |info| {
        success(&info.url);
        if let Some(final_url) = &info.final_url {
            field("Redirected to", final_url);
        }
        field("Size", format!("{} ({} bytes)", format_bytes(info.size), info.size));
        if let Some(ct) = &info.content_type {
            field("Type", ct);
        }
        field(
            "Resumable",
            if info.resumable {
                style("Yes").green()
            } else {
                style("No").yellow()
            },
        );
    })
}

// ============================================================================
// Download
// ============================================================================

async fn run_download(
    core: &IpaFetch,
    args: &DownloadArgs,
    format: OutputFormat,
) -> Result<DownloadOutcome> {
    let spec = args.spec();
    let work_dir = args.work_dir();
    debug!("Part files for {} go to {:?}", spec.url, work_dir);

    let progress = TransferProgress::for_download(format == OutputFormat::Human);
    let listener = progress.clone().listen(core.subscribe());

    let result = core.download(&spec, args.output(), &work_dir).await;
    listener.abort();

    match result {
        Ok(outcome) => {
            progress.finish("Download complete");
            Ok(outcome)
        }
        Err(e) => {
            progress.abandon(&e.to_string());
            Err(e).with_context(|| {
                format!(
                    "Download failed; part files kept in {} for the next run",
                    work_dir.display()
                )
            })
        }
    }
}

fn print_download(outcome: &DownloadOutcome, elapsed: std::time::Duration) {
    success(format!("Saved {}", style(outcome.path.display()).cyan()));
    field("Size", format_bytes(outcome.final_size));
    field(
        "Parts",
        format!("{} ({} resumed)", outcome.part_count, outcome.resumed_parts),
    );
    field("Took", format_duration(elapsed));
}

pub async fn download(core: &IpaFetch, args: &DownloadArgs, format: OutputFormat) -> Result<()> {
    let started = Instant::now();
    let outcome = run_download(core, args, format).await?;
    let elapsed = started.elapsed();

    print_output(&outcome, format, |outcome| print_download(outcome, elapsed))
}

// ============================================================================
// Sign
// ============================================================================

async fn read_bundle(bundle_path: &Path, checksum: Option<String>) -> Result<SignatureBundle> {
    let mut bundle = load_bundle(bundle_path)
        .await
        .with_context(|| format!("Failed to load bundle {}", bundle_path.display()))?;
    if checksum.is_some() {
        bundle.expected_checksum = checksum;
    }
    Ok(bundle)
}

async fn run_sign(
    core: &IpaFetch,
    file: &Path,
    bundle: &SignatureBundle,
    format: OutputFormat,
) -> Result<SignOutcome> {
    let progress = TransferProgress::for_signing(format == OutputFormat::Human);
    let listener = progress.clone().listen(core.subscribe());

    let result = core.sign(file, bundle).await;
    listener.abort();

    match result {
        Ok(outcome) => {
            progress.finish("Signed");
            Ok(outcome)
        }
        Err(e) => {
            progress.abandon(&e.to_string());
            Err(e).with_context(|| format!("Failed to sign {}", file.display()))
        }
    }
}

fn print_sign(outcome: &SignOutcome) {
    success(format!("Signed {}", style(outcome.path.display()).cyan()));
    field("Signature", &outcome.signature_path);
    field(
        "Checksum",
        if outcome.checksum_verified {
            style("verified").green()
        } else {
            style("not checked").dim()
        },
    );
    field(
        "Entries",
        format!(
            "{} copied, {} replaced",
            outcome.copied_entries, outcome.replaced_entries
        ),
    );
}

pub async fn sign(
    core: &IpaFetch,
    file: &Path,
    bundle_path: &Path,
    checksum: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let bundle = read_bundle(bundle_path, checksum).await?;
    let outcome = run_sign(core, file, &bundle, format).await?;
    print_output(&outcome, format, print_sign)
}

// ============================================================================
// Fetch
// ============================================================================

#[derive(Serialize)]
struct FetchReport {
    download: DownloadOutcome,
    sign: SignOutcome,
    removed_parts: usize,
}

pub async fn fetch(
    core: &IpaFetch,
    args: &DownloadArgs,
    bundle_path: &Path,
    keep_parts: bool,
    format: OutputFormat,
) -> Result<()> {
    let bundle = read_bundle(bundle_path, None).await?;

    let started = Instant::now();
    let download = run_download(core, args, format).await?;
    let sign = run_sign(core, &download.path, &bundle, format).await?;

    let removed_parts = if keep_parts {
        0
    } else {
        let work_dir = args.work_dir();
        info!("Removing part files from {:?}", work_dir);
        core.cleanup(&work_dir)
            .await
            .with_context(|| format!("Failed to clean up {}", work_dir.display()))?
    };
    let elapsed = started.elapsed();

    let report = FetchReport {
        download,
        sign,
        removed_parts,
    };
    print_output(&report, format, |report| {
        print_download(&report.download, elapsed);
        print_sign(&report.sign);
        if report.removed_parts > 0 {
            field("Cleaned up", format!("{} part files", report.removed_parts));
        }
    })
}
