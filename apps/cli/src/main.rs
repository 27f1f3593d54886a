//! ipafetch CLI - chunked app archive downloader and signer
//!
//! Downloads a large archive in parallel ranged chunks, resumes from part
//! files left by an earlier run, and injects a signature bundle in place.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ipafetch_types::{
    DownloadSpec, DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_BASE_DELAY_MS,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ipafetch - resumable app archive downloader
#[derive(Parser)]
#[command(name = "ipafetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the size and range support of a URL
    Probe {
        /// URL to probe
        url: String,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Download a URL in parallel chunks
    Download(DownloadArgs),

    /// Inject a signature bundle into an archive in place
    Sign {
        /// Archive to sign
        file: PathBuf,

        /// Signature bundle JSON
        #[arg(short, long)]
        bundle: PathBuf,

        /// Expected MD5 or SHA-256 of the archive, overriding the bundle
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Download, sign, then remove the part files
    Fetch {
        #[command(flatten)]
        download: DownloadArgs,

        /// Signature bundle JSON
        #[arg(short, long)]
        bundle: PathBuf,

        /// Keep part files after signing
        #[arg(long)]
        keep_parts: bool,
    },
}

/// Options shared by every command that talks to the server
#[derive(Args, Clone, Debug)]
pub struct RequestArgs {
    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Per-request timeout in seconds
    #[arg(long, env = "IPAFETCH_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    timeout: u64,
}

impl RequestArgs {
    pub fn apply(&self, mut spec: DownloadSpec) -> DownloadSpec {
        for (name, value) in &self.headers {
            spec = spec.with_header(name.clone(), value.clone());
        }
        spec.with_request_timeout(Duration::from_secs(self.timeout))
    }
}

#[derive(Args, Clone, Debug)]
pub struct DownloadArgs {
    /// URL to download
    url: String,

    /// Output file path
    #[arg(short, long)]
    output: PathBuf,

    /// Directory for part files [default: <cache dir>/ipafetch/<output stem>]
    #[arg(long, env = "IPAFETCH_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Total size in bytes, skips the size probe
    #[arg(long)]
    size: Option<u64>,

    /// Number of chunks fetched at once
    #[arg(short, long, env = "IPAFETCH_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Chunk size in bytes
    #[arg(long, env = "IPAFETCH_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Attempts per chunk
    #[arg(long, env = "IPAFETCH_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Base delay between attempts in milliseconds (grows linearly)
    #[arg(long, env = "IPAFETCH_RETRY_DELAY_MS", default_value_t = DEFAULT_RETRY_BASE_DELAY_MS)]
    retry_delay_ms: u64,

    /// Abort queued and in-flight chunks once one chunk fails
    #[arg(long)]
    cancel_on_failure: bool,

    #[command(flatten)]
    request: RequestArgs,
}

impl DownloadArgs {
    pub fn spec(&self) -> DownloadSpec {
        let mut spec = DownloadSpec::new(&self.url)
            .with_chunk_size(self.chunk_size)
            .with_concurrency(self.concurrency)
            .with_max_retries(self.retries)
            .with_retry_base_delay(Duration::from_millis(self.retry_delay_ms))
            .with_cancel_on_failure(self.cancel_on_failure);
        if let Some(size) = self.size {
            spec = spec.with_total_size(size);
        }
        self.request.apply(spec)
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    /// Part-file directory, keyed by the output name so reruns resume
    pub fn work_dir(&self) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ipafetch")
            .join(stem)
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {:?}", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let core = ipafetch_core::IpaFetch::new()?;

    match cli.command {
        Commands::Probe { url, request } => {
            commands::probe(&core, &url, &request, cli.output).await?
        }

        Commands::Download(args) => commands::download(&core, &args, cli.output).await?,

        Commands::Sign {
            file,
            bundle,
            checksum,
        } => commands::sign(&core, &file, &bundle, checksum, cli.output).await?,

        Commands::Fetch {
            download,
            bundle,
            keep_parts,
        } => commands::fetch(&core, &download, &bundle, keep_parts, cli.output).await?,
    }

    Ok(())
}
