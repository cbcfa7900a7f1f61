//! End-to-end tests of the loader against fake decoders.
//!
//! The decoders are shell scripts that print canned PSML/PDML, so these run
//! without Wireshark installed.

#![cfg(unix)]

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capflow::error::ProcessError;
use capflow::parser::DetailStream;
use capflow::{Error, LoadState, Loader, LoaderEvent, Source};
use common::*;
use tokio::io::BufReader;

fn source() -> Source {
    // The fake decoders never open it
    Source::File(PathBuf::from("/nonexistent/capture.pcap"))
}

#[tokio::test]
async fn test_rows_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 100, None, 0, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));

    let generation = loader.request(source(), "");
    let seen = until_done(&mut events, generation).await;

    assert_eq!(
        seen.first(),
        Some(&LoaderEvent::Started {
            generation,
            incremental: false
        })
    );
    let indices: Vec<u64> = rows_of(&seen, generation).iter().map(|r| r.index).collect();
    assert_eq!(indices, (1..=100).collect::<Vec<_>>());
    assert_eq!(
        seen.last(),
        Some(&LoaderEvent::Completed {
            generation,
            rows: 100
        })
    );
    assert_eq!(loader.state(), LoadState::Completed(generation));
    assert!(eventually(Duration::from_secs(2), || loader.live_pipelines() == 0).await);

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rapid_requests_never_leak_stale_rows() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 40, Some("0.02"), 0, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));

    let mut generations = Vec::new();
    for filter in ["tcp", "udp", "dns", "arp", "icmp"] {
        generations.push(loader.request(source(), filter));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let last = *generations.last().unwrap();
    let seen = until_done(&mut events, last).await;

    // Channel order is send order, and sends are gated on the current generation
    let tagged: Vec<u64> = seen.iter().filter_map(LoaderEvent::generation).collect();
    assert!(tagged.windows(2).all(|w| w[0] <= w[1]));
    for event in &seen {
        if let LoaderEvent::Completed { generation, .. } | LoaderEvent::Failed { generation, .. } = event {
            assert_eq!(*generation, last);
        }
    }
    assert_eq!(rows_of(&seen, last).len(), 40);

    // Every superseded pipeline is reaped
    assert!(eventually(Duration::from_secs(5), || loader.live_pipelines() == 0).await);
    assert!(events.try_recv().is_err());

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spawn_error_fails_request() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, mut events) = Loader::new(config(&dir.path().join("missing-tshark")));

    let generation = loader.request(source(), "");
    let seen = until_done(&mut events, generation).await;
    match seen.last() {
        Some(LoaderEvent::Failed { error, .. }) => assert!(error.contains("Failed to spawn"), "{}", error),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(loader.state(), LoadState::Failed(generation));

    // A later request is unaffected
    let tshark = fake_tshark(dir.path(), 3, None, 0, DetailEnd::Clean);
    drop(loader);
    let (loader, mut events) = Loader::new(config(&tshark));
    let generation = loader.request(source(), "");
    let seen = until_done(&mut events, generation).await;
    assert_eq!(rows_of(&seen, generation).len(), 3);
    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abnormal_exit_keeps_earlier_rows() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{}\ni=1\nwhile [ $i -le 5 ]; do\n  {}\n  i=$((i+1))\ndone\necho 'tshark: invalid filter' >&2\nexit 2\n",
        PSML_HEAD, PSML_ROW
    );
    let tshark = script(dir.path(), "tshark", &body);
    let (loader, mut events) = Loader::new(config(&tshark));

    let generation = loader.request(source(), "ip.bogus");
    let seen = until_done(&mut events, generation).await;
    assert_eq!(rows_of(&seen, generation).len(), 5);
    match seen.last() {
        Some(LoaderEvent::Failed { error, .. }) => assert!(error.contains("invalid filter"), "{}", error),
        other => panic!("unexpected: {:?}", other),
    }
    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_killed_detail_decoder_keeps_decoded_trees() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 100, None, 50, DetailEnd::KilledMidTree);
    let mut config = config(&tshark);
    config.decoder.detail_chunk = 100;
    let (loader, mut events) = Loader::new(config);

    let generation = loader.request(source(), "");
    until_done(&mut events, generation).await;

    let err = loader.detail(1).await.unwrap_err();
    assert!(
        matches!(err, Error::Process(ProcessError::AbnormalExit { .. })),
        "{:?}",
        err
    );
    assert_eq!(loader.cache_stats().entries, 50);

    // From here on the decoder must not run again
    let marker = dir.path().join("ran");
    script(
        dir.path(),
        "tshark",
        &format!("touch {}\nexit 1\n", marker.display()),
    );
    for index in [1, 25, 50] {
        let tree = loader.detail(index).await.unwrap().unwrap();
        assert_eq!(tree.index, index);
    }
    assert!(!marker.exists());
    assert!(loader.detail(51).await.is_err());
    assert!(marker.exists());

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cached_tree_matches_direct_decode() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 10, None, 10, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));
    let generation = loader.request(source(), "udp");
    until_done(&mut events, generation).await;

    let decoded = loader.detail(3).await.unwrap().unwrap();
    let cached = loader.detail(3).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&decoded, &cached));
    assert!(loader.cache_stats().hits >= 1);

    let mut child = tokio::process::Command::new(&tshark)
        .args(["-T", "pdml"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut direct = DetailStream::new(BufReader::new(stdout), Default::default());
    let mut found = None;
    while let Some(tree) = direct.next_artifact().await.unwrap() {
        if tree.index == 3 {
            found = Some(tree);
        }
    }
    child.wait().await.unwrap();

    let found = found.unwrap();
    assert_eq!(*cached, found);
    assert_eq!(cached.raw_bytes(), vec![0x00, 0x35, 0x04, 0x00]);
    assert_eq!(cached.find("udp.srcport").unwrap().label(), "Source Port: 53");

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_detail_does_not_outlive_its_generation() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = slow_detail_tshark(dir.path(), 5, 5, "0.5");
    let (loader, mut events) = Loader::new(config(&tshark));
    let loader = Arc::new(loader);

    let first = loader.request(source(), "udp");
    until_done(&mut events, first).await;

    let pending = tokio::spawn({
        let loader = loader.clone();
        async move { loader.detail(1).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = loader.request(source(), "tcp");

    match pending.await.unwrap() {
        Err(Error::Superseded(generation)) => assert_eq!(generation, first),
        other => panic!("stale detail reached the caller: {:?}", other),
    }
    until_done(&mut events, second).await;
    assert!(eventually(Duration::from_secs(2), || loader.live_pipelines() == 0).await);

    // The same packet under the new generation decodes normally
    let tree = loader.detail(1).await.unwrap().unwrap();
    assert_eq!(tree.index, 1);

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_keeps_delivered_rows() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 100, Some("0.05"), 3, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));

    let generation = loader.request(source(), "");
    let mut seen = Vec::new();
    while rows_of(&seen, generation).len() < 5 {
        seen.push(next_event(&mut events).await);
    }
    assert_eq!(loader.stop(), Some(generation));

    assert!(eventually(Duration::from_secs(2), || loader.state() == LoadState::Cancelled(generation)).await);
    assert!(eventually(Duration::from_secs(2), || loader.live_pipelines() == 0).await);
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(rows_of(&seen, generation).len() < 100);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, LoaderEvent::Completed { .. } | LoaderEvent::Failed { .. })));

    // Still current, so its packets can be inspected
    assert_eq!(loader.current_generation(), generation);
    assert_eq!(loader.detail(2).await.unwrap().unwrap().index, 2);
    assert_eq!(loader.stop(), None);

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_filter_change_invalidates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 5, None, 5, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));

    let generation = loader.request(source(), "udp");
    until_done(&mut events, generation).await;
    loader.detail(2).await.unwrap().unwrap();
    assert!(loader.cached(2).is_some());

    let generation = loader.request(source(), "udp.port == 53");
    until_done(&mut events, generation).await;
    assert!(loader.cached(2).is_none());
    assert_eq!(loader.cache_stats().entries, 0);

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = fake_tshark(dir.path(), 4, None, 4, DetailEnd::Clean);
    let (loader, mut events) = Loader::new(config(&tshark));

    let first = loader.request(source(), "");
    until_done(&mut events, first).await;

    let second = loader.reload().unwrap();
    assert!(second > first);
    let seen = until_done(&mut events, second).await;
    assert_eq!(rows_of(&seen, second).len(), 4);

    loader.clear();
    assert_eq!(loader.state(), LoadState::Idle);
    assert!(loader.reload().is_none());
    assert!(loader.detail(1).await.unwrap().is_none());

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persisted_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.pcap");
    std::fs::write(&capture, pcap_header()).unwrap();
    let tshark = fake_tshark(dir.path(), 3, None, 3, DetailEnd::Clean);
    let mut config = config(&tshark);
    config.cache.persist_dir = Some(dir.path().join("cache"));

    let (loader, mut events) = Loader::new(config.clone());
    let generation = loader.request(Source::File(capture.clone()), "");
    until_done(&mut events, generation).await;
    loader.detail(1).await.unwrap().unwrap();
    loader.shutdown().await.unwrap();

    let (loader, mut events) = Loader::new(config);
    let generation = loader.request(Source::File(capture.clone()), "");
    until_done(&mut events, generation).await;
    assert!(loader.cached(1).is_some());

    // A changed file makes the saved trees untrustworthy
    let generation = loader.request(Source::File(capture.clone()), "tcp");
    until_done(&mut events, generation).await;
    append(&capture, &pcap_record(1));
    let generation = loader.request(Source::File(capture), "");
    until_done(&mut events, generation).await;
    assert!(loader.cached(1).is_none());

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_derived_reports() {
    let dir = tempfile::tempdir().unwrap();
    let tshark = script(
        dir.path(),
        "tshark",
        "echo \"conversations: $*\"\n",
    );
    let capinfos = script(dir.path(), "capinfos", "echo \"File name: $1\"\n");
    let mut config = config(&tshark);
    config.decoder.capinfos = capinfos;
    let (loader, _events) = Loader::new(config);

    loader.request(Source::File(PathBuf::from("/tmp/x.pcap")), "");
    let report = loader.conversations("tcp").await.unwrap().unwrap();
    assert!(report.contains("-z conv,tcp"), "{}", report);
    let info = loader.capture_info().await.unwrap().unwrap();
    assert_eq!(info.trim(), "File name: /tmp/x.pcap");

    loader.shutdown().await.unwrap();
}
