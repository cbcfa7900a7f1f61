//! Live-capture tailer.
//!
//! Watches a capture file that is still being written and reports growth in
//! whole packets. Bursts of growth inside the debounce window collapse into
//! one event. For legacy pcap files the complete records are located with
//! `pcap-parser`, so a reload only has to decode what was appended; other
//! formats are reported as plain growth.
//!
//! If file notifications cannot be set up, or fail later, the tailer polls.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use pcap_parser::{parse_pcap_frame, parse_pcap_frame_be, parse_pcap_header};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::model::Anchor;

const READ_CHUNK: usize = 1 << 20;
const LEGACY_HEADER_LEN: usize = 24;

/// What the tailer knows about the file so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailState {
    pub last_size: u64,
    /// End of the last complete record seen
    pub last_offset: u64,
    /// Complete records before `last_offset`
    pub packets: u64,
    /// Growth seen, reload not yet scheduled
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Layout {
    LegacyPcap { header: Vec<u8>, big_endian: bool },
    Other,
}

/// Growth reported to the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// Complete legacy pcap records now occupy `[offset, end)`
    Appended {
        header: Vec<u8>,
        offset: u64,
        end: u64,
        first_index: u64,
        packets: u64,
    },
    /// The file grew, but its records are not located (pcapng and others)
    Grew { size: u64 },
    /// The file shrank or was replaced; everything must be reloaded
    Reset,
}

impl TailEvent {
    /// Where a reload for this event starts. `last_index` is the highest
    /// packet index already delivered.
    pub fn anchor(&self, last_index: u64) -> Anchor {
        match self {
            TailEvent::Appended {
                header,
                offset,
                end,
                first_index,
                ..
            } => Anchor::Segment {
                header: header.clone(),
                offset: *offset,
                end: *end,
                first_index: *first_index,
            },
            TailEvent::Grew { .. } => Anchor::After(last_index),
            TailEvent::Reset => Anchor::Start,
        }
    }

    /// Fold a later event into this one, for growth held back while a load
    /// is still running.
    pub fn absorb(self, later: TailEvent) -> TailEvent {
        match (self, later) {
            (TailEvent::Reset, _) | (_, TailEvent::Reset) => TailEvent::Reset,
            (
                TailEvent::Appended {
                    header,
                    offset,
                    first_index,
                    packets,
                    ..
                },
                TailEvent::Appended {
                    end,
                    packets: more,
                    ..
                },
            ) => TailEvent::Appended {
                header,
                offset,
                end,
                first_index,
                packets: packets + more,
            },
            (_, later) => later,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Watching,
    Polling,
}

/// Which file sits behind the path: device and inode on unix, creation time
/// elsewhere. A change means the file was replaced, whatever its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId(u64, u64);

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId(metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_id(metadata: &std::fs::Metadata) -> Option<FileId> {
    let created = metadata.created().ok()?.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(FileId(created.as_secs(), u64::from(created.subsec_nanos())))
}

pub struct Tailer {
    path: PathBuf,
    config: TailConfig,
    state: TailState,
    layout: Option<Layout>,
    identity: Option<FileId>,
}

fn detect_layout(path: &Path) -> io::Result<Option<Layout>> {
    let mut head = [0u8; LEGACY_HEADER_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    if filled < 4 {
        return Ok(None);
    }
    match parse_pcap_header(&head[..filled]) {
        Ok((_, header)) => Ok(Some(Layout::LegacyPcap {
            header: head.to_vec(),
            big_endian: header.is_bigendian(),
        })),
        Err(_) if filled < LEGACY_HEADER_LEN => Ok(None),
        Err(_) => Ok(Some(Layout::Other)),
    }
}

/// Count complete records in `[start, end)`; returns (records, end of last one)
fn walk_records(path: &Path, start: u64, end: u64, big_endian: bool) -> io::Result<(u64, u64)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut remaining = end.saturating_sub(start);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    let mut records = 0;
    let mut offset = start;

    while remaining > 0 {
        let want = chunk.len().min(remaining as usize);
        let n = file.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
        pending.extend_from_slice(&chunk[..n]);

        let mut rest = pending.as_slice();
        loop {
            let parsed = if big_endian {
                parse_pcap_frame_be(rest)
            } else {
                parse_pcap_frame(rest)
            };
            match parsed {
                Ok((tail, _)) if tail.len() < rest.len() => {
                    records += 1;
                    rest = tail;
                }
                _ => break,
            }
        }
        let consumed = pending.len() - rest.len();
        offset += consumed as u64;
        pending.drain(..consumed);
    }
    Ok((records, offset))
}

impl Tailer {
    pub fn new(path: impl Into<PathBuf>, config: TailConfig) -> Self {
        Self {
            path: path.into(),
            config,
            state: TailState::default(),
            layout: None,
            identity: None,
        }
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take in everything already in the file.
    ///
    /// Returns the event describing the existing contents, which is what the
    /// initial load should cover, or `None` if there is nothing yet.
    pub fn prime(&mut self) -> io::Result<Option<TailEvent>> {
        self.state = TailState::default();
        self.layout = None;
        self.identity = None;
        self.scan()
    }

    fn replaced(&self, id: Option<FileId>) -> bool {
        matches!((self.identity, id), (Some(known), Some(now)) if known != now)
    }

    /// Compare the file against the last scan and report new complete packets.
    pub fn scan(&mut self) -> io::Result<Option<TailEvent>> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let size = metadata.len();
        let id = file_id(&metadata);

        if size < self.state.last_size || self.replaced(id) {
            info!(
                "{} shrank or was replaced ({} -> {} bytes), starting over",
                self.path.display(),
                self.state.last_size,
                size
            );
            self.state = TailState::default();
            self.layout = None;
            self.identity = None;
            return Ok(Some(TailEvent::Reset));
        }
        if size == self.state.last_size {
            return Ok(None);
        }

        if self.layout.is_none() {
            self.layout = detect_layout(&self.path)?;
        }
        let Some(layout) = self.layout.clone() else {
            // Too short to tell what it is yet
            return Ok(None);
        };
        self.state.last_size = size;
        self.identity = id;

        match layout {
            Layout::Other => Ok(Some(TailEvent::Grew { size })),
            Layout::LegacyPcap { header, big_endian } => {
                let start = self.state.last_offset.max(header.len() as u64);
                let (packets, end) = walk_records(&self.path, start, size, big_endian)?;
                if packets == 0 {
                    debug!("{} grew without completing a packet", self.path.display());
                    return Ok(None);
                }
                let event = TailEvent::Appended {
                    header,
                    offset: start,
                    end,
                    first_index: self.state.packets + 1,
                    packets,
                };
                self.state.last_offset = end;
                self.state.packets += packets;
                Ok(Some(event))
            }
        }
    }

    fn watch(&self, tx: mpsc::Sender<notify::Result<notify::Event>>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                // Bursts are coalesced anyway, so a full channel loses nothing
                let _ = tx.try_send(res);
            },
            Config::default(),
        )?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for growth", dir.display());
        Ok(watcher)
    }

    fn concerns(&self, event: &notify::Event) -> bool {
        event
            .paths
            .iter()
            .any(|p| p == &self.path || p.file_name() == self.path.file_name())
    }

    fn note_growth(&mut self, deadline: &mut Option<Instant>) {
        if deadline.is_some() {
            return;
        }
        let changed = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len() != self.state.last_size || self.replaced(file_id(&metadata)),
            Err(_) => false,
        };
        if changed {
            self.state.pending = true;
            *deadline = Some(Instant::now() + self.config.debounce());
        }
    }

    /// Run until `cancel` fires, sending one event per debounced burst.
    pub fn spawn(mut self, tx: mpsc::Sender<TailEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx, cancel).await })
    }

    async fn run(&mut self, tx: mpsc::Sender<TailEvent>, cancel: CancellationToken) {
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let watcher = if self.config.force_poll {
            None
        } else {
            match self.watch(notify_tx) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("File notifications unavailable ({}), polling instead", e);
                    None
                }
            }
        };
        let mode = if watcher.is_some() {
            Mode::Watching
        } else {
            Mode::Polling
        };
        self.follow(tx, cancel, watcher, notify_rx, mode).await;
    }

    async fn follow(
        &mut self,
        tx: mpsc::Sender<TailEvent>,
        cancel: CancellationToken,
        mut watcher: Option<RecommendedWatcher>,
        mut notify_rx: mpsc::Receiver<notify::Result<notify::Event>>,
        mut mode: Mode,
    ) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;

        loop {
            let debounce = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(res) = notify_rx.recv(), if mode == Mode::Watching => match res {
                    Ok(event) if self.concerns(&event) => self.note_growth(&mut deadline),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("File watcher failed ({}), polling {} instead", e, self.path.display());
                        watcher = None;
                        mode = Mode::Polling;
                    }
                },

                _ = poll.tick(), if mode == Mode::Polling => self.note_growth(&mut deadline),

                _ = debounce => {
                    deadline = None;
                    self.state.pending = false;
                    match self.scan() {
                        Ok(Some(event)) => {
                            debug!("Tail event: {:?}", event);
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to scan {}: {}", self.path.display(), e),
                    }
                }
            }
        }
        drop(watcher);
        debug!("Tailer for {} stopped", self.path.display());
    }
}
