//! Loader facade.
//!
//! The viewer talks to a [`Loader`]: it requests a source and filter, reads
//! [`LoaderEvent`]s from the receiver it got at construction, and pulls detail
//! trees by index. Behind it a control task owns the live-capture machinery
//! (capture process, tailer, deferred reloads), and every load runs as its own
//! set of tasks under a fresh generation.
//!
//! Events leave through [`Coordinator::deliver`] and nowhere else, so once a
//! request returns its generation, nothing tagged with an older one is sent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{ArtifactCache, CacheScope, CacheStats, SourceFingerprint};
use crate::config::{Config, ParsePolicy};
use crate::decoder::{Decoder, SummaryPlan};
use crate::error::{Error, ParseError, ProcessError, Result};
use crate::generation::{Coordinator, GenerationCounter, LoadState, Outcome, Tagged, Ticket};
use crate::model::{Anchor, DetailArtifact, Generation, LoadRequest, PacketRange, Source, SummaryRow};
use crate::parser::{DetailStream, ParseWarning, SummaryStream};
use crate::process::{self, KillOutcome, PipelineHandle, PipelineSpec};
use crate::tail::{TailEvent, Tailer};

/// Notifications for the viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// A generation started. Incremental loads append to the rows already
    /// shown; the others replace them.
    Started { generation: Generation, incremental: bool },
    Row(Tagged<SummaryRow>),
    Warning(Tagged<ParseWarning>),
    Completed { generation: Generation, rows: u64 },
    Failed { generation: Generation, error: String },
    /// The interface capture process ended
    CaptureStopped { error: Option<String> },
}

impl LoaderEvent {
    pub fn generation(&self) -> Option<Generation> {
        match self {
            LoaderEvent::Started { generation, .. }
            | LoaderEvent::Completed { generation, .. }
            | LoaderEvent::Failed { generation, .. } => Some(*generation),
            LoaderEvent::Row(tagged) => Some(tagged.generation),
            LoaderEvent::Warning(tagged) => Some(tagged.generation),
            LoaderEvent::CaptureStopped { .. } => None,
        }
    }
}

/// What the viewer last asked for.
#[derive(Debug, Clone)]
struct Session {
    source: Source,
    filter: String,
    range: Option<PacketRange>,
    /// Highest row index delivered so far
    last_index: Arc<AtomicU64>,
}

impl Session {
    fn scope(&self) -> CacheScope {
        let identity = match &self.source {
            Source::Pipe(command) => format!("pipe:{}", command),
            other => other
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        };
        CacheScope::new(identity, self.filter.trim())
    }
}

struct Shared {
    config: Config,
    decoder: Decoder,
    coordinator: Coordinator,
    cache: ArtifactCache,
    events: mpsc::UnboundedSender<LoaderEvent>,
    session: Mutex<Option<Session>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn publish(&self, generation: Generation, event: LoaderEvent) -> bool {
        self.coordinator.deliver(Tagged::new(generation, event), |tagged| {
            let _ = self.events.send(tagged.payload);
        })
    }

    fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }
}

enum Command {
    Start { ticket: Ticket, session: Session },
    Finished(Generation),
    Clear,
    Shutdown(oneshot::Sender<()>),
}

/// Parser output on its way to the forwarding task
enum Parsed {
    Row(SummaryRow),
    Warning(ParseWarning),
}

pub struct Loader {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Loader {
    /// Create a loader and the receiver its events arrive on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<LoaderEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            decoder: Decoder::new(config.decoder.clone(), &config.pipeline),
            coordinator: Coordinator::new(Arc::new(GenerationCounter::new())),
            cache: ArtifactCache::from_config(&config.cache),
            events: events_tx,
            session: Mutex::new(None),
            shutdown: CancellationToken::new(),
            config,
        });
        let control = Control {
            shared: shared.clone(),
            commands: commands_tx.clone(),
            live: None,
            capture: None,
            pending: None,
            scoped_file: None,
        };
        let task = tokio::spawn(control.run(commands_rx));
        let loader = Self {
            shared,
            commands: commands_tx,
            task: Mutex::new(Some(task)),
        };
        (loader, events_rx)
    }

    /// Load `source` under `filter`, superseding whatever is loading now.
    pub fn request(&self, source: Source, filter: impl Into<String>) -> Generation {
        self.request_range(source, filter, None)
    }

    /// Like [`Loader::request`], limited to the packets in `range`.
    pub fn request_range(&self, source: Source, filter: impl Into<String>, range: Option<PacketRange>) -> Generation {
        let session = Session {
            source,
            filter: filter.into(),
            range,
            last_index: Arc::new(AtomicU64::new(0)),
        };
        let ticket = {
            let mut current = self.shared.session.lock();
            let ticket = self.shared.coordinator.begin();
            *current = Some(session.clone());
            ticket
        };
        let generation = ticket.generation;
        info!(
            "Generation {}: requested {:?} with filter {:?}",
            generation, session.source, session.filter
        );
        if self.commands.send(Command::Start { ticket, session }).is_err() {
            warn!("Loader control task is gone, generation {} cannot start", generation);
            self.shared.coordinator.finish(generation, Outcome::Failed);
        }
        generation
    }

    /// Re-issue the last request under a new generation
    pub fn reload(&self) -> Option<Generation> {
        let session = self.shared.session()?;
        Some(self.request_range(session.source, session.filter, session.range))
    }

    /// Cancel everything, stop any capture and tailer, and forget the cache.
    pub fn clear(&self) {
        {
            let mut current = self.shared.session.lock();
            self.shared.coordinator.cancel_all();
            *current = None;
        }
        let _ = self.commands.send(Command::Clear);
    }

    pub fn state(&self) -> LoadState {
        self.shared.coordinator.state()
    }

    pub fn current_generation(&self) -> Generation {
        self.shared.coordinator.counter().current()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    /// Pipelines that have not yet exited or been killed
    pub fn live_pipelines(&self) -> usize {
        self.shared.coordinator.live_pipelines()
    }

    /// The cached tree for `index`, without decoding
    pub fn cached(&self, index: u64) -> Option<Arc<DetailArtifact>> {
        let session = self.shared.session()?;
        self.shared.cache.get_scoped(&session.scope(), index)
    }

    /// Detail tree for `index`, from cache or freshly decoded.
    ///
    /// The decoder is asked for the whole chunk around `index`; every tree it
    /// finishes goes into the cache, even if it fails before reaching
    /// `index`. `Ok(None)` means nothing is loaded or the packet does not
    /// pass the filter.
    ///
    /// A decode belongs to the generation current when it was asked for. If
    /// a newer one starts first, the decoder is shut down and the call fails
    /// with [`Error::Superseded`]; trees already finished stay cached while
    /// their scope is unchanged. Dropping the future kills the decoder.
    pub async fn detail(&self, index: u64) -> Result<Option<Arc<DetailArtifact>>> {
        let (session, ticket) = {
            let current = self.shared.session.lock();
            (current.clone(), self.shared.coordinator.current())
        };
        let (Some(session), Some(ticket)) = (session, ticket) else {
            return Ok(None);
        };
        let generation = ticket.generation;
        let scope = session.scope();
        if let Some(hit) = self.shared.cache.get_scoped(&scope, index) {
            return Ok(Some(hit));
        }

        let range = PacketRange::chunk_around(index, self.shared.config.decoder.detail_chunk);
        let spec = self.shared.decoder.detail(&session.source, &session.filter, range);
        debug!(
            "Generation {}: decoding detail for packets {}..{}",
            generation, range.start, range.end
        );

        let _lease = self.shared.coordinator.lease();
        let shutdown = self.shared.shutdown.child_token();
        let mut handle = process::start(&spec)?;
        let decoded = tokio::select! {
            result = async {
                let found = decode_into_cache(&self.shared, &mut handle, &scope, index).await?;
                handle.wait().await?;
                Ok::<_, Error>(found)
            } => result,
            _ = ticket.superseded.cancelled() => Err(Error::Superseded(generation)),
            _ = shutdown.cancelled() => Err(Error::Shutdown),
        };
        if decoded.is_err() {
            handle.shutdown(self.shared.config.pipeline.grace_period()).await;
        }
        let found = decoded?;
        if !self.shared.coordinator.counter().is_current(generation) {
            debug!("Generation {}: detail for packet {} is stale", generation, index);
            return Err(Error::Superseded(generation));
        }
        Ok(found)
    }

    /// Stop the running load, keeping the rows delivered so far.
    ///
    /// Unlike a new request this does not supersede the generation: no
    /// `Completed` or `Failed` follows, the state settles on `Cancelled`, and
    /// detail requests keep working. Returns the stopped generation.
    pub fn stop(&self) -> Option<Generation> {
        let stopped = self.shared.coordinator.stop();
        if let Some(generation) = stopped {
            info!("Generation {} stopped", generation);
        }
        stopped
    }

    /// Conversation table of `kind` for the current source and filter
    pub async fn conversations(&self, kind: &str) -> Result<Option<String>> {
        let Some(session) = self.shared.session() else {
            return Ok(None);
        };
        let spec = self
            .shared
            .decoder
            .conversations(&session.source, &session.filter, kind);
        self.report(&spec).await.map(Some)
    }

    /// Capture file metadata for the current source
    pub async fn capture_info(&self) -> Result<Option<String>> {
        let Some(spec) = self
            .shared
            .session()
            .and_then(|session| self.shared.decoder.capture_info(&session.source))
        else {
            return Ok(None);
        };
        self.report(&spec).await.map(Some)
    }

    async fn report(&self, spec: &PipelineSpec) -> Result<String> {
        let _lease = self.shared.coordinator.lease();
        Ok(process::run_to_string(spec).await?)
    }

    /// Cancel all work, stop capturing, persist the cache, and wait for the
    /// control task to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(tx))
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Loader control task failed: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shared.coordinator.cancel_all();
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("state", &self.state())
            .field("live_pipelines", &self.live_pipelines())
            .field("cache", &self.shared.cache)
            .finish()
    }
}

async fn decode_into_cache(
    shared: &Shared,
    handle: &mut PipelineHandle,
    scope: &CacheScope,
    index: u64,
) -> Result<Option<Arc<DetailArtifact>>> {
    let stdout = handle.take_stdout().ok_or(ProcessError::NotStarted)?;
    let mut trees = DetailStream::new(BufReader::new(stdout), shared.config.parse);
    let mut found = None;
    while let Some(artifact) = trees.next_artifact().await? {
        let artifact = Arc::new(artifact);
        if artifact.index == index {
            found = Some(artifact.clone());
        }
        shared.cache.put_scoped(scope, artifact);
    }
    for warning in trees.take_warnings() {
        warn!("Detail stream: {} at byte {}", warning.reason, warning.position);
    }
    Ok(found)
}

async fn parse_rows(
    stdout: ChildStdout,
    policy: ParsePolicy,
    index_base: u64,
    generation: Generation,
    tx: mpsc::Sender<Tagged<Parsed>>,
) -> std::result::Result<(), ParseError> {
    let mut rows = SummaryStream::new(BufReader::new(stdout), policy).with_index_base(index_base);
    loop {
        let next = rows.next_row().await;
        for warning in rows.take_warnings() {
            if tx.send(Tagged::new(generation, Parsed::Warning(warning))).await.is_err() {
                return Ok(());
            }
        }
        match next? {
            Some(row) => {
                if tx.send(Tagged::new(generation, Parsed::Row(row))).await.is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

/// Forward parsed rows to the viewer until the stream ends, then reap.
async fn forward_rows(
    shared: &Shared,
    handle: &mut PipelineHandle,
    plan: &SummaryPlan,
    generation: Generation,
    last_index: &AtomicU64,
) -> Result<u64> {
    let stdout = handle.take_stdout().ok_or(ProcessError::NotStarted)?;
    let (tx, mut rx) = mpsc::channel(shared.config.pipeline.channel_capacity.max(1));
    let parser = tokio::spawn(parse_rows(stdout, shared.config.parse, plan.index_base, generation, tx));
    let parser_abort = parser.abort_handle();

    let forwarded = async {
        let mut rows = 0;
        while let Some(tagged) = rx.recv().await {
            let event = match tagged.payload {
                Parsed::Row(row) => {
                    let index = row.index;
                    if !shared.publish(generation, LoaderEvent::Row(Tagged::new(generation, row))) {
                        return Err(Error::Superseded(generation));
                    }
                    last_index.fetch_max(index, Ordering::SeqCst);
                    rows += 1;
                    continue;
                }
                Parsed::Warning(warning) => LoaderEvent::Warning(Tagged::new(generation, warning)),
            };
            shared.publish(generation, event);
        }
        parser
            .await
            .map_err(|e| ParseError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(rows)
    }
    .await;

    if forwarded.is_err() {
        parser_abort.abort();
    }
    let rows = forwarded?;
    handle.wait().await?;
    Ok(rows)
}

async fn run_summary(shared: &Shared, ticket: &Ticket, plan: &SummaryPlan, last_index: &AtomicU64) -> Result<u64> {
    let mut handle = process::start(&plan.spec)?;
    let grace = shared.config.pipeline.grace_period();

    let result = tokio::select! {
        result = forward_rows(shared, &mut handle, plan, ticket.generation, last_index) => result,
        _ = ticket.cancel.cancelled() => Err(if ticket.superseded.is_cancelled() {
            Error::Superseded(ticket.generation)
        } else {
            Error::Stopped(ticket.generation)
        }),
    };

    match result {
        Ok(rows) => Ok(rows),
        Err(Error::Parse(e)) => {
            // A decoder that died explains a broken stream better than the parser
            if handle.shutdown(grace).await == KillOutcome::AlreadyExited {
                handle.wait().await?;
            }
            Err(e.into())
        }
        Err(e) => {
            handle.shutdown(grace).await;
            Err(e)
        }
    }
}

struct LiveSession {
    path: PathBuf,
    cancel: CancellationToken,
    events: mpsc::Receiver<TailEvent>,
    task: JoinHandle<()>,
}

struct Capture {
    source: Source,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns everything that outlives a single generation.
struct Control {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    live: Option<LiveSession>,
    capture: Option<Capture>,
    /// Growth seen while a load was running
    pending: Option<TailEvent>,
    /// File behind the cache's current scope, for persistence
    scoped_file: Option<PathBuf>,
}

async fn next_tail_event(live: &mut Option<LiveSession>) -> Option<TailEvent> {
    match live {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Where the first load of a live file starts, given what the tailer found
fn baseline_anchor(baseline: &TailEvent) -> Anchor {
    match baseline {
        TailEvent::Appended { .. } => baseline.anchor(0),
        TailEvent::Grew { .. } | TailEvent::Reset => Anchor::Start,
    }
}

impl Control {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { ticket, session }) => self.start(ticket, session).await,
                    Some(Command::Finished(generation)) => self.finished(generation).await,
                    Some(Command::Clear) => self.clear().await,
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = self.shared.shutdown.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                Some(event) = next_tail_event(&mut self.live) => self.on_tail(event).await,
            }
        }
        debug!("Loader control task stopped");
    }

    async fn start(&mut self, ticket: Ticket, session: Session) {
        if ticket.cancel.is_cancelled() {
            debug!("Generation {} superseded before it started", ticket.generation);
            return;
        }
        self.pending = None;
        self.switch_scope(&session);

        match &session.source {
            Source::Live(path) | Source::Interface { capture_file: path, .. } => {
                self.ensure_capture(&session.source).await;
                match self.restart_tail(path).await {
                    Some(baseline) => self.spawn_load(ticket, &session, baseline_anchor(&baseline), false),
                    None => self.complete_empty(ticket.generation),
                }
            }
            Source::File(_) | Source::Pipe(_) => {
                self.stop_live().await;
                self.stop_capture().await;
                self.spawn_load(ticket, &session, Anchor::Start, false);
            }
        }
    }

    fn spawn_load(&self, ticket: Ticket, session: &Session, anchor: Anchor, incremental: bool) {
        let request = LoadRequest {
            source: session.source.clone(),
            filter: session.filter.clone(),
            range: session.range,
            anchor,
            generation: ticket.generation,
        };
        let plan = self.shared.decoder.summary(&request);
        let decoder = plan.spec.stages.last().map(ToString::to_string).unwrap_or_default();
        info!("Generation {}: {}", request.generation, decoder);

        let shared = self.shared.clone();
        let done = self.commands.clone();
        let last_index = session.last_index.clone();
        let lease = shared.coordinator.lease();
        tokio::spawn(async move {
            let _lease = lease;
            let generation = ticket.generation;
            shared.publish(generation, LoaderEvent::Started { generation, incremental });

            match run_summary(&shared, &ticket, &plan, &last_index).await {
                Ok(rows) => {
                    info!("Generation {} completed with {} rows", generation, rows);
                    if shared.coordinator.finish(generation, Outcome::Completed) {
                        shared.publish(generation, LoaderEvent::Completed { generation, rows });
                    }
                }
                Err(Error::Superseded(_) | Error::Stopped(_)) => {
                    debug!("Generation {} cancelled", generation);
                    shared.coordinator.finish(generation, Outcome::Cancelled);
                }
                Err(e) => {
                    warn!("Generation {} failed: {}", generation, e);
                    if shared.coordinator.finish(generation, Outcome::Failed) {
                        shared.publish(
                            generation,
                            LoaderEvent::Failed {
                                generation,
                                error: e.to_string(),
                            },
                        );
                    }
                }
            }
            let _ = done.send(Command::Finished(generation));
        });
    }

    /// Finish a generation that has nothing to read yet
    fn complete_empty(&self, generation: Generation) {
        self.shared.publish(
            generation,
            LoaderEvent::Started {
                generation,
                incremental: false,
            },
        );
        if self.shared.coordinator.finish(generation, Outcome::Completed) {
            self.shared
                .publish(generation, LoaderEvent::Completed { generation, rows: 0 });
        }
    }

    async fn finished(&mut self, generation: Generation) {
        if self.shared.coordinator.state().is_loading() {
            return;
        }
        if let Some(event) = self.pending.take() {
            debug!("Generation {} done, issuing deferred live reload", generation);
            self.reload_tail(event).await;
        }
    }

    async fn on_tail(&mut self, event: TailEvent) {
        if self.shared.coordinator.state().is_loading() {
            debug!("Deferring live reload until the current load finishes");
            self.pending = Some(match self.pending.take() {
                Some(held) => held.absorb(event),
                None => event,
            });
            return;
        }
        self.reload_tail(event).await;
    }

    async fn reload_tail(&mut self, event: TailEvent) {
        let Some(session) = self.shared.session() else {
            return;
        };
        match event {
            TailEvent::Reset => {
                let Some(path) = session.source.path().cloned() else {
                    return;
                };
                info!("{} was replaced, reloading from the start", path.display());
                let ticket = self.shared.coordinator.begin();
                session.last_index.store(0, Ordering::SeqCst);
                self.shared.cache.clear();
                self.shared.cache.rescope(session.scope());
                match self.restart_tail(&path).await {
                    Some(baseline) => self.spawn_load(ticket, &session, baseline_anchor(&baseline), false),
                    None => self.complete_empty(ticket.generation),
                }
            }
            event => {
                let ticket = self.shared.coordinator.begin();
                let anchor = event.anchor(session.last_index.load(Ordering::SeqCst));
                self.spawn_load(ticket, &session, anchor, true);
            }
        }
    }

    /// Replace the tailer with a fresh one for `path` and return what is
    /// already in the file.
    async fn restart_tail(&mut self, path: &Path) -> Option<TailEvent> {
        self.stop_live().await;
        let mut tailer = Tailer::new(path, self.shared.config.tail.clone());
        let primed = tokio::task::spawn_blocking(move || {
            let baseline = tailer.prime();
            (tailer, baseline)
        })
        .await;
        let (tailer, baseline) = match primed {
            Ok(primed) => primed,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        let baseline = baseline.unwrap_or_else(|e| {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        });

        let (tx, rx) = mpsc::channel(16);
        let cancel = self.shared.shutdown.child_token();
        let task = tailer.spawn(tx, cancel.clone());
        self.live = Some(LiveSession {
            path: path.to_path_buf(),
            cancel,
            events: rx,
            task,
        });
        baseline
    }

    async fn stop_live(&mut self) {
        if let Some(live) = self.live.take() {
            debug!("Stopping tailer for {}", live.path.display());
            live.cancel.cancel();
            let _ = live.task.await;
        }
        self.pending = None;
    }

    async fn ensure_capture(&mut self, source: &Source) {
        if self.capture.as_ref().map_or(false, |capture| &capture.source == source) {
            return;
        }
        self.stop_capture().await;
        let Source::Interface {
            interface,
            capture_file,
        } = source
        else {
            return;
        };

        let spec = self.shared.decoder.capture(interface, capture_file);
        let cancel = self.shared.shutdown.child_token();
        let mut handle = match process::start(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start capture on {}: {}", interface, e);
                let _ = self.shared.events.send(LoaderEvent::CaptureStopped {
                    error: Some(e.to_string()),
                });
                return;
            }
        };
        info!("Capturing {} into {}", interface, capture_file.display());

        let events = self.shared.events.clone();
        let grace = self.shared.config.pipeline.grace_period();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            let exited = tokio::select! {
                result = handle.wait() => Some(result),
                _ = stop.cancelled() => None,
            };
            let error = match exited {
                None => {
                    handle.shutdown(grace).await;
                    info!("Capture stopped");
                    return;
                }
                Some(Ok(())) => None,
                Some(Err(e)) => Some(e.to_string()),
            };
            warn!("Capture exited: {:?}", error);
            let _ = events.send(LoaderEvent::CaptureStopped { error });
        });
        self.capture = Some(Capture {
            source: source.clone(),
            cancel,
            task,
        });
    }

    async fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.cancel.cancel();
            let _ = capture.task.await;
        }
    }

    fn persist_cache(&self) {
        let (Some(dir), Some(path)) = (&self.shared.config.cache.persist_dir, &self.scoped_file) else {
            return;
        };
        let fingerprint = match SourceFingerprint::of(path) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                debug!("Not persisting cache, {} is unreadable: {}", path.display(), e);
                return;
            }
        };
        if let Err(e) = self.shared.cache.persist(dir, &fingerprint) {
            warn!("Failed to persist cache: {}", e);
        }
    }

    /// Point the cache at `session`'s scope, saving the old scope's trees and
    /// restoring any saved ones for the new scope.
    fn switch_scope(&mut self, session: &Session) {
        let scope = session.scope();
        if self.shared.cache.scope().as_ref() == Some(&scope) {
            return;
        }
        self.persist_cache();
        self.scoped_file = match &session.source {
            Source::File(path) => Some(path.clone()),
            _ => None,
        };

        let restorable = self
            .shared
            .config
            .cache
            .persist_dir
            .as_ref()
            .zip(self.scoped_file.as_ref());
        match restorable {
            Some((dir, path)) => match SourceFingerprint::of(path) {
                Ok(fingerprint) => {
                    self.shared.cache.restore(dir, &scope, &fingerprint);
                }
                Err(_) => {
                    self.shared.cache.rescope(scope);
                }
            },
            None => {
                self.shared.cache.rescope(scope);
            }
        }
    }

    async fn clear(&mut self) {
        self.stop_live().await;
        self.stop_capture().await;
        self.persist_cache();
        self.scoped_file = None;
        self.shared.cache.clear();
        info!("Loader cleared");
    }

    async fn shutdown(&mut self) {
        self.shared.coordinator.cancel_all();
        self.shared.shutdown.cancel();
        self.stop_live().await;
        self.stop_capture().await;

        let deadline = tokio::time::Instant::now() + self.shared.config.pipeline.grace_period() + Duration::from_secs(1);
        while self.shared.coordinator.live_pipelines() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.shared.coordinator.live_pipelines() > 0 {
            warn!(
                "{} pipelines still running at shutdown",
                self.shared.coordinator.live_pipelines()
            );
        }
        self.persist_cache();
        info!("Loader shut down");
    }
}
