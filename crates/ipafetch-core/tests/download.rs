//! Chunked download against a local range server

mod common;

use common::{dir_listing, payload, serve, ServerBehavior};
use ipafetch_core::{IpaError, IpaFetch};
use ipafetch_types::{ChunkRange, CoreEvent, DownloadSpec};
use std::time::Duration;

const KIB: usize = 1024;

fn spec_for(url: &str) -> DownloadSpec {
    DownloadSpec::new(url)
        .with_chunk_size(5 * KIB as u64)
        .with_retry_base_delay(Duration::from_millis(5))
        .with_request_timeout(Duration::from_secs(10))
}

fn write_parts(dir: &std::path::Path, data: &[u8], ranges: &[ChunkRange]) {
    std::fs::create_dir_all(dir).unwrap();
    for range in ranges {
        std::fs::write(
            dir.join(range.part_file_name()),
            &data[range.start as usize..=range.end as usize],
        )
        .unwrap();
    }
}

#[tokio::test]
async fn downloads_and_merges_in_order() {
    let data = payload(47 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let core = IpaFetch::new().unwrap();
    let outcome = core
        .download(&spec_for(&server.url).with_concurrency(4), &out, &work)
        .await
        .unwrap();

    assert_eq!(outcome.final_size, data.len() as u64);
    assert_eq!(outcome.part_count, 10);
    assert_eq!(outcome.resumed_parts, 0);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(server.stats.range_gets(), 10);
    assert_eq!(server.stats.heads(), 1);

    // Part files stay until cleanup
    assert_eq!(dir_listing(&work).len(), 10);
    assert_eq!(core.cleanup(&work).await.unwrap(), 10);
    assert!(!work.exists());
}

#[tokio::test]
async fn resumes_from_complete_parts() {
    let data = payload(47 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let ranges = ChunkRange::plan(data.len() as u64, 5 * KIB as u64);
    write_parts(&work, &data, &ranges[..5]);

    let core = IpaFetch::new().unwrap();
    let outcome = core
        .download(&spec_for(&server.url), &out, &work)
        .await
        .unwrap();

    assert_eq!(server.stats.range_gets(), 5);
    assert_eq!(outcome.resumed_parts, 5);
    assert_eq!(outcome.final_size, 47 * KIB as u64);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn complete_parts_need_no_requests() {
    let data = payload(12 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let ranges = ChunkRange::plan(data.len() as u64, 5 * KIB as u64);
    write_parts(&work, &data, &ranges);

    let spec = spec_for(&server.url).with_total_size(data.len() as u64);
    let outcome = IpaFetch::new()
        .unwrap()
        .download(&spec, &out, &work)
        .await
        .unwrap();

    assert_eq!(server.stats.range_gets(), 0);
    assert_eq!(server.stats.heads(), 0);
    assert_eq!(outcome.resumed_parts, 3);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn refetches_part_with_wrong_length() {
    let data = payload(10 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("part_0"), b"truncated").unwrap();
    std::fs::write(work.join("part_1.tmp"), b"stale").unwrap();

    let spec = spec_for(&server.url).with_total_size(data.len() as u64);
    let outcome = IpaFetch::new()
        .unwrap()
        .download(&spec, &out, &work)
        .await
        .unwrap();

    assert_eq!(outcome.resumed_parts, 0);
    assert_eq!(server.stats.range_gets(), 2);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(dir_listing(&work), vec!["part_0", "part_1"]);
}

#[tokio::test]
async fn retries_are_bounded() {
    let data = payload(1000);
    let server = serve(
        data,
        ServerBehavior {
            always_fail: true,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let core = IpaFetch::new().unwrap();
    let mut events = core.subscribe();
    let spec = spec_for(&server.url)
        .with_total_size(1000)
        .with_max_retries(3);
    let err = core.download(&spec, &out, &work).await.unwrap_err();

    match err {
        IpaError::ChunkFetchFailed {
            index,
            start,
            end,
            attempts,
            ..
        } => {
            assert_eq!((index, start, end, attempts), (0, 0, 999, 3));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.stats.range_gets(), 3);
    assert!(!out.exists());
    assert!(dir_listing(&work).is_empty());

    let mut retries = 0;
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::ChunkRetry { max_attempts, .. } => {
                assert_eq!(max_attempts, 3);
                retries += 1;
            }
            CoreEvent::ChunkFailed { index, .. } => {
                assert_eq!(index, 0);
                failed = true;
            }
            _ => {}
        }
    }
    assert_eq!(retries, 2);
    assert!(failed);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let data = payload(9 * KIB);
    let server = serve(
        data.clone(),
        ServerBehavior {
            fail_first: 2,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("app.ipa");

    let spec = spec_for(&server.url)
        .with_total_size(data.len() as u64)
        .with_concurrency(1)
        .with_max_retries(3);
    IpaFetch::new()
        .unwrap()
        .download(&spec, &out, &dir.path().join("work"))
        .await
        .unwrap();

    assert_eq!(server.stats.range_gets(), 4);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn siblings_finish_after_a_failure_by_default() {
    let data = payload(40 * KIB);
    let server = serve(
        data.clone(),
        ServerBehavior {
            fail_start: Some(0),
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let spec = spec_for(&server.url)
        .with_total_size(data.len() as u64)
        .with_concurrency(1)
        .with_max_retries(2);
    let err = IpaFetch::new()
        .unwrap()
        .download(&spec, &dir.path().join("app.ipa"), &work)
        .await
        .unwrap_err();

    assert!(matches!(err, IpaError::ChunkFetchFailed { index: 0, .. }));
    assert_eq!(server.stats.range_gets(), 2 + 7);
    let expected: Vec<String> = (1..8).map(|i| format!("part_{i}")).collect();
    assert_eq!(dir_listing(&work), expected);
}

#[tokio::test]
async fn cancel_on_failure_stops_queued_chunks() {
    let data = payload(40 * KIB);
    let server = serve(
        data.clone(),
        ServerBehavior {
            fail_start: Some(0),
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let spec = spec_for(&server.url)
        .with_total_size(data.len() as u64)
        .with_concurrency(1)
        .with_max_retries(2)
        .with_cancel_on_failure(true);
    let err = IpaFetch::new()
        .unwrap()
        .download(&spec, &dir.path().join("app.ipa"), &work)
        .await
        .unwrap_err();

    assert!(matches!(err, IpaError::ChunkFetchFailed { index: 0, .. }));
    // At most one queued chunk may start before the cancellation lands
    assert!(server.stats.range_gets() <= 3);
    assert!(dir_listing(&work).len() <= 1);
}

#[tokio::test]
async fn auth_headers_are_sent_with_every_request() {
    let data = payload(11 * KIB);
    let server = serve(
        data.clone(),
        ServerBehavior {
            required_header: Some(("x-store-token".into(), "secret".into())),
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("app.ipa");
    let core = IpaFetch::new().unwrap();

    let denied = core
        .download(
            &spec_for(&server.url).with_max_retries(1),
            &out,
            &dir.path().join("denied"),
        )
        .await;
    assert!(denied.is_err());

    let spec = spec_for(&server.url).with_header("X-Store-Token", "secret");
    core.download(&spec, &out, &dir.path().join("work"))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn probe_falls_back_to_ranged_get() {
    let data = payload(3 * KIB + 7);
    let server = serve(
        data.clone(),
        ServerBehavior {
            no_head: true,
            ..Default::default()
        },
    )
    .await;

    let info = IpaFetch::new()
        .unwrap()
        .probe(&spec_for(&server.url))
        .await
        .unwrap();

    assert_eq!(info.size, data.len() as u64);
    assert!(info.resumable);
    assert_eq!(server.stats.heads(), 1);
    assert_eq!(server.stats.probes(), 1);
}

#[tokio::test]
async fn probe_uses_head_content_length() {
    let data = payload(2 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;

    let info = IpaFetch::new()
        .unwrap()
        .probe(&spec_for(&server.url))
        .await
        .unwrap();

    assert_eq!(info.size, data.len() as u64);
    assert!(info.resumable);
    assert_eq!(server.stats.probes(), 0);
}

#[tokio::test]
async fn progress_reports_reach_the_total() {
    let data = payload(23 * KIB);
    let server = serve(data.clone(), ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();

    let core = IpaFetch::new().unwrap();
    let mut events = core.subscribe();
    core.download(
        &spec_for(&server.url),
        &dir.path().join("app.ipa"),
        &dir.path().join("work"),
    )
    .await
    .unwrap();

    let mut last = None;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::Progress(snapshot) => last = Some(snapshot),
            CoreEvent::ChunkCompleted { .. } => completed += 1,
            _ => {}
        }
    }
    let last = last.expect("final progress snapshot");
    assert_eq!(last.done, data.len() as u64);
    assert!(last.is_finished());
    assert_eq!(completed, 5);
}

#[tokio::test]
async fn full_body_answer_fits_a_single_chunk() {
    let data = payload(3000);
    let server = serve(
        data.clone(),
        ServerBehavior {
            ignore_range: true,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let spec = spec_for(&server.url)
        .with_total_size(3000)
        .with_chunk_size(4096);
    let outcome = IpaFetch::new()
        .unwrap()
        .download(&spec, &out, &work)
        .await
        .unwrap();

    assert_eq!(outcome.final_size, 3000);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(dir_listing(&work), vec!["part_0"]);
}

#[tokio::test]
async fn full_body_answer_to_a_range_is_a_length_mismatch() {
    let data = payload(3000);
    let server = serve(
        data,
        ServerBehavior {
            ignore_range: true,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let out = dir.path().join("app.ipa");

    let core = IpaFetch::new().unwrap();
    let mut events = core.subscribe();
    let spec = spec_for(&server.url)
        .with_total_size(3000)
        .with_chunk_size(1000)
        .with_max_retries(3);
    let err = core.download(&spec, &out, &work).await.unwrap_err();

    match err {
        IpaError::ChunkFetchFailed {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(
                reason.contains("Body length mismatch: expected 1000 bytes"),
                "{reason}"
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.stats.range_gets(), 3 * 3);
    assert!(!out.exists());
    assert!(dir_listing(&work).is_empty());

    // Bytes of failed attempts are taken back out of the progress total
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Progress(snapshot) = event {
            last = Some(snapshot);
        }
    }
    assert_eq!(last.expect("final progress snapshot").done, 0);
}
