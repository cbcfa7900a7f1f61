//! Shared helpers: fake decoders written as shell scripts, pcap fixtures and
//! event collection.

#![allow(dead_code)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capflow::{Config, Generation, LoaderEvent, SummaryRow};
use tokio::sync::mpsc::UnboundedReceiver;

pub const PSML_HEAD: &str = r#"echo '<?xml version="1.0" encoding="utf-8"?>'
echo '<psml version="0" creator="fake">'
echo '<structure><section>No.</section><section>Time</section><section>Source</section><section>Destination</section><section>Protocol</section><section>Length</section><section>Info</section></structure>'"#;

pub const PSML_ROW: &str = r#"echo "<packet><section>$i</section><section>0.$i</section><section>10.0.0.1</section><section>10.0.0.2</section><section>UDP</section><section>60</section><section>packet $i</section></packet>""#;

pub const PDML_TREE: &str = r#"echo "<packet><proto name=\"geninfo\" pos=\"0\" size=\"4\"><field name=\"num\" pos=\"0\" show=\"$i\" size=\"4\"/></proto><proto name=\"udp\" showname=\"User Datagram Protocol\" pos=\"0\" size=\"4\"><field name=\"udp.srcport\" showname=\"Source Port: 53\" pos=\"0\" size=\"2\" show=\"53\" value=\"0035\"/><field name=\"udp.dstport\" pos=\"2\" size=\"2\" show=\"$i\" value=\"0400\"/></proto></packet>""#;

/// Write an executable `/bin/sh` script
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// How the fake decoder ends its detail output
pub enum DetailEnd {
    Clean,
    /// Start another tree, then die from SIGKILL
    KilledMidTree,
}

/// A fake tshark: `rows` summary rows (each after `row_delay`), or `trees`
/// detail trees when asked for PDML. Input and filters are ignored.
pub fn fake_tshark(dir: &Path, rows: u64, row_delay: Option<&str>, trees: u64, end: DetailEnd) -> PathBuf {
    tshark_script(dir, rows, row_delay, trees, None, end)
}

/// Like [`fake_tshark`], but PDML output starts only after `detail_delay`
pub fn slow_detail_tshark(dir: &Path, rows: u64, trees: u64, detail_delay: &str) -> PathBuf {
    tshark_script(dir, rows, None, trees, Some(detail_delay), DetailEnd::Clean)
}

fn tshark_script(
    dir: &Path,
    rows: u64,
    row_delay: Option<&str>,
    trees: u64,
    detail_delay: Option<&str>,
    end: DetailEnd,
) -> PathBuf {
    let delay = row_delay.map(|d| format!("sleep {}", d)).unwrap_or_default();
    let detail_delay = detail_delay.map(|d| format!("sleep {}", d)).unwrap_or_default();
    let end = match end {
        DetailEnd::Clean => "echo '</pdml>'".to_string(),
        DetailEnd::KilledMidTree => "echo '<packet><proto name=\"eth\" pos=\"0\"'\nkill -9 $$".to_string(),
    };
    let body = format!(
        r#"mode=psml
for arg in "$@"; do
  if [ "$arg" = "pdml" ]; then mode=pdml; fi
done
if [ "$mode" = "psml" ]; then
{psml_head}
  i=1
  while [ $i -le {rows} ]; do
    {row}
    {delay}
    i=$((i+1))
  done
  echo '</psml>'
else
  {detail_delay}
  echo '<pdml version="0" creator="fake">'
  i=1
  while [ $i -le {trees} ]; do
    {tree}
    i=$((i+1))
  done
  {end}
fi
"#,
        psml_head = PSML_HEAD,
        rows = rows,
        row = PSML_ROW,
        delay = delay,
        detail_delay = detail_delay,
        trees = trees,
        tree = PDML_TREE,
        end = end,
    );
    script(dir, "tshark", &body)
}

pub fn config(tshark: &Path) -> Config {
    let mut config = Config::default();
    config.decoder.tshark = tshark.to_path_buf();
    config.pipeline.grace_period_ms = 200;
    config
}

pub async fn next_event(events: &mut UnboundedReceiver<LoaderEvent>) -> LoaderEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for a loader event")
        .expect("loader event channel closed")
}

/// Every event up to and including the terminal one for `generation`
pub async fn until_done(events: &mut UnboundedReceiver<LoaderEvent>, generation: Generation) -> Vec<LoaderEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(
            &event,
            LoaderEvent::Completed { generation: g, .. } | LoaderEvent::Failed { generation: g, .. } if *g == generation
        );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Rows of `generation` among `events`
pub fn rows_of(events: &[LoaderEvent], generation: Generation) -> Vec<SummaryRow> {
    events
        .iter()
        .filter_map(|event| match event {
            LoaderEvent::Row(tagged) if tagged.generation == generation => Some(tagged.payload.clone()),
            _ => None,
        })
        .collect()
}

/// Poll `check` until it holds or `within` runs out
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub const RECORD_LEN: u64 = 16 + 42;

pub fn pcap_header() -> Vec<u8> {
    let mut h = Vec::new();
    h.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
    h.extend_from_slice(&2u16.to_le_bytes());
    h.extend_from_slice(&4u16.to_le_bytes());
    h.extend_from_slice(&0i32.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes());
    h.extend_from_slice(&65535u32.to_le_bytes());
    h.extend_from_slice(&1u32.to_le_bytes());
    h
}

pub fn pcap_record(seq: u32) -> Vec<u8> {
    let data = [seq as u8; 42];
    let mut r = Vec::new();
    r.extend_from_slice(&seq.to_le_bytes());
    r.extend_from_slice(&0u32.to_le_bytes());
    r.extend_from_slice(&(data.len() as u32).to_le_bytes());
    r.extend_from_slice(&(data.len() as u32).to_le_bytes());
    r.extend_from_slice(&data);
    r
}

pub fn append(path: &Path, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
}
