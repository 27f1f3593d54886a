//! Shared helpers for integration tests: a local range-capable HTTP server
//! and app archive builders.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const ASSET_PATH: &str = "/asset.ipa";

/// How the test server misbehaves
#[derive(Debug, Clone, Default)]
pub struct ServerBehavior {
    /// Answer HEAD with 405
    pub no_head: bool,
    /// Answer every ranged GET with 500
    pub always_fail: bool,
    /// Answer the first N ranged GETs with 500
    pub fail_first: usize,
    /// Answer ranged GETs starting at this offset with 500
    pub fail_start: Option<u64>,
    /// Answer ranged GETs with 200 and the whole body
    pub ignore_range: bool,
    /// Require this header on every request
    pub required_header: Option<(String, String)>,
}

#[derive(Clone)]
struct ServerState {
    data: Arc<Vec<u8>>,
    behavior: Arc<ServerBehavior>,
    stats: Arc<ServerStats>,
}

/// Request counters
#[derive(Debug, Default)]
pub struct ServerStats {
    pub heads: AtomicUsize,
    /// `bytes=0-0` size probes
    pub probes: AtomicUsize,
    /// Ranged GETs for chunk data
    pub range_gets: AtomicUsize,
    pub failures_left: AtomicUsize,
}

impl ServerStats {
    pub fn range_gets(&self) -> usize {
        self.range_gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

pub struct TestServer {
    pub url: String,
    pub stats: Arc<ServerStats>,
}

/// Serve `data` at `ASSET_PATH` on an ephemeral local port
pub async fn serve(data: Vec<u8>, behavior: ServerBehavior) -> TestServer {
    let stats = Arc::new(ServerStats::default());
    stats.failures_left.store(behavior.fail_first, Ordering::SeqCst);

    let state = ServerState {
        data: Arc::new(data),
        behavior: Arc::new(behavior),
        stats: stats.clone(),
    };
    let app = Router::new()
        .route(ASSET_PATH, get(get_asset).head(head_asset))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("http://{}{}", addr, ASSET_PATH),
        stats,
    }
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    match &state.behavior.required_header {
        Some((name, value)) => headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v == value)
            .unwrap_or(false),
        None => true,
    }
}

fn status(code: StatusCode) -> Response {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .unwrap()
}

async fn head_asset(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    state.stats.heads.fetch_add(1, Ordering::SeqCst);
    if state.behavior.no_head {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    }
    if !authorized(&state, &headers) {
        return status(StatusCode::FORBIDDEN);
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, state.data.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::empty())
        .unwrap()
}

async fn get_asset(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return status(StatusCode::FORBIDDEN);
    }

    let total = state.data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    let full_body = || {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from(state.data.as_ref().clone()))
            .unwrap()
    };
    let Some((start, end)) = range else {
        return full_body();
    };

    if start == 0 && end == 0 {
        state.stats.probes.fetch_add(1, Ordering::SeqCst);
    } else {
        state.stats.range_gets.fetch_add(1, Ordering::SeqCst);

        if state.behavior.always_fail || state.behavior.fail_start == Some(start) {
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let failed = state
            .stats
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    if state.behavior.ignore_range {
        return full_body();
    }
    if start >= total {
        return status(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    let end = end.min(total - 1);
    let body = state.data[start as usize..=end as usize].to_vec();

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Deterministic, non-repeating-per-chunk test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn manifest_plist(sinf_paths: &[&str]) -> Vec<u8> {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "SinfPaths".to_string(),
        plist::Value::Array(sinf_paths.iter().map(|p| plist::Value::from(*p)).collect()),
    );
    let mut out = Vec::new();
    plist::Value::Dictionary(dict).to_writer_xml(&mut out).unwrap();
    out
}

/// Entries of a small but realistic app archive; `None` marks a directory
pub fn app_entries() -> Vec<(String, Option<Vec<u8>>)> {
    vec![
        ("Payload/".into(), None),
        ("Payload/Demo.app/".into(), None),
        ("Payload/Demo.app/Demo".into(), Some(payload(20_000))),
        ("Payload/Demo.app/Info.plist".into(), Some(b"<plist/>".to_vec())),
        (
            "Payload/Demo.app/SC_Info/Manifest.plist".into(),
            Some(manifest_plist(&["SC_Info/Demo.sinf"])),
        ),
        (
            "Payload/Demo.app/PlugIns/Share.appex/SC_Info/Manifest.plist".into(),
            Some(manifest_plist(&["SC_Info/Share.sinf"])),
        ),
        ("Payload/Demo.app/Assets.car".into(), Some(payload(7_000))),
        ("Payload/Demo.app/empty.txt".into(), Some(Vec::new())),
    ]
}

pub fn write_archive(path: &Path, entries: &[(String, Option<Vec<u8>>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    for (name, content) in entries {
        match content {
            Some(bytes) => {
                writer
                    .start_file(name.as_str(), SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(bytes).unwrap();
            }
            None => writer
                .add_directory(name.as_str(), SimpleFileOptions::default())
                .unwrap(),
        }
    }
    writer.finish().unwrap();
}

/// Every entry of an archive as (name, decompressed content)
pub fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (entry.name().to_string(), content)
        })
        .collect()
}

/// Files left in a directory, sorted
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
