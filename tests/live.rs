//! Following a capture file that is still being written.

#![cfg(unix)]

mod common;

use std::time::Duration;

use capflow::config::TailConfig;
use capflow::{Loader, LoaderEvent, Source};
use common::*;

/// A fake tshark that reports one row per 58-byte record in its input,
/// whether that is a file (`-r path`) or stdin (`-r -`).
fn counting_tshark(dir: &std::path::Path, startup_delay: &str) -> std::path::PathBuf {
    let body = format!(
        r#"prev=""
input=""
for arg in "$@"; do
  if [ "$prev" = "-r" ]; then input="$arg"; fi
  prev="$arg"
done
if [ "$input" = "-" ]; then
  bytes=$(wc -c | tr -d ' ')
else
  bytes=$(wc -c < "$input" | tr -d ' ')
fi
sleep {delay}
n=$(( (bytes - 24) / {record} ))
{head}
i=1
while [ $i -le $n ]; do
  {row}
  i=$((i+1))
done
echo '</psml>'
"#,
        delay = startup_delay,
        record = RECORD_LEN,
        head = PSML_HEAD,
        row = PSML_ROW,
    );
    script(dir, "tshark", &body)
}

async fn next_start(events: &mut tokio::sync::mpsc::UnboundedReceiver<LoaderEvent>) -> (u64, bool) {
    loop {
        if let LoaderEvent::Started {
            generation,
            incremental,
        } = next_event(events).await
        {
            return (generation, incremental);
        }
    }
}

#[tokio::test]
async fn test_growth_is_loaded_incrementally() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("live.pcap");
    append(&capture, &pcap_header());
    append(&capture, &pcap_record(1));
    append(&capture, &pcap_record(2));

    let tshark = counting_tshark(dir.path(), "0.3");
    let mut config = config(&tshark);
    config.tail = TailConfig {
        debounce_ms: 150,
        poll_interval_ms: 20,
        force_poll: true,
    };
    let (loader, mut events) = Loader::new(config);

    let first = loader.request(Source::Live(capture.clone()), "");
    assert_eq!(next_start(&mut events).await, (first, false));

    // Lands while the first load is still running; it must wait, not cancel it
    for seq in 3..=5 {
        append(&capture, &pcap_record(seq));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = until_done(&mut events, first).await;
    let indices: Vec<u64> = rows_of(&seen, first).iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2]);
    assert!(matches!(seen.last(), Some(LoaderEvent::Completed { rows: 2, .. })));

    // One reload carries all three appended packets
    let (second, incremental) = next_start(&mut events).await;
    assert!(incremental);
    let seen = until_done(&mut events, second).await;
    let indices: Vec<u64> = rows_of(&seen, second).iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![3, 4, 5]);

    // Replacing the file starts over
    let replacement = dir.path().join("replacement.pcap");
    append(&replacement, &pcap_header());
    append(&replacement, &pcap_record(9));
    std::fs::rename(&replacement, &capture).unwrap();

    let (third, incremental) = next_start(&mut events).await;
    assert!(!incremental);
    let seen = until_done(&mut events, third).await;
    let indices: Vec<u64> = rows_of(&seen, third).iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1]);

    loader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quiet_file_triggers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("live.pcap");
    append(&capture, &pcap_header());
    append(&capture, &pcap_record(1));

    let tshark = counting_tshark(dir.path(), "0");
    let mut config = config(&tshark);
    config.tail.debounce_ms = 50;
    config.tail.poll_interval_ms = 20;
    config.tail.force_poll = true;
    let (loader, mut events) = Loader::new(config);

    let generation = loader.request(Source::Live(capture), "");
    until_done(&mut events, generation).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(loader.current_generation(), generation);

    loader.shutdown().await.unwrap();
}
