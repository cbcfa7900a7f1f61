//! Process runner for external decoder pipelines.
//!
//! A pipeline is one or more stages, each stage's stdout connected to the
//! next stage's stdin. All stages share one process group on unix so a kill
//! reaches anything they fork. Every handle ends in a terminal state (exited
//! or killed) before it is dropped; `Drop` force-kills as a last resort.

mod signal;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

pub use signal::Termination;

/// One command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }

    fn to_command(&self, process_group: Option<u32>) -> Command {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd.args(&self.args);
        for (key, value) in &self.envs {
            std_cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            std_cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(process_group.map(|pgid| pgid as i32).unwrap_or(0));
        }
        #[cfg(not(unix))]
        let _ = process_group;

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Bytes written to the first stage's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinFeed {
    Bytes(Vec<u8>),
    /// `prefix`, then `[start, end)` of the file at `path`
    FileSegment {
        prefix: Vec<u8>,
        path: PathBuf,
        start: u64,
        end: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub stages: Vec<CommandSpec>,
    pub stdin: Option<StdinFeed>,
    pub stderr_tail_bytes: usize,
}

impl PipelineSpec {
    pub fn single(command: CommandSpec) -> Self {
        Self {
            stages: vec![command],
            stdin: None,
            stderr_tail_bytes: 4096,
        }
    }

    /// Prepend a stage whose stdout feeds the current first stage
    pub fn after(mut self, upstream: CommandSpec) -> Self {
        self.stages.insert(0, upstream);
        self
    }

    pub fn with_stdin(mut self, feed: StdinFeed) -> Self {
        self.stdin = Some(feed);
        self
    }

    pub fn with_stderr_tail(mut self, bytes: usize) -> Self {
        self.stderr_tail_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Exited,
    Killed,
}

/// Result of asking a pipeline to die.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// A signal was delivered to at least one live stage
    Signalled,
    /// Every stage had already exited (or had already been killed)
    AlreadyExited,
}

/// Last `capacity` bytes of a stage's stderr.
#[derive(Debug, Clone)]
struct StderrTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64 * 1024)))),
            capacity,
        }
    }

    fn push(&self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let mut buf = self.buf.lock();
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (buf.len() + bytes.len()).saturating_sub(self.capacity);
        buf.drain(..overflow);
        buf.extend(bytes);
    }

    fn contents(&self) -> String {
        let buf = self.buf.lock();
        let (a, b) = buf.as_slices();
        let mut joined = Vec::with_capacity(a.len() + b.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        String::from_utf8_lossy(&joined).trim().to_string()
    }
}

struct Stage {
    program: String,
    child: Child,
    status: Option<ExitStatus>,
    stderr: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl Stage {
    fn poll_exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("try_wait on {} failed: {}", self.program, e);
                false
            }
        }
    }
}

/// OS resources of one running pipeline.
pub struct PipelineHandle {
    stages: Vec<Stage>,
    process_group: Option<u32>,
    stdout: Option<ChildStdout>,
    feed_task: Option<JoinHandle<()>>,
    started: Instant,
    state: PipelineState,
}

/// Start every stage of `spec`.
///
/// Stages already started are killed if a later one fails to spawn.
pub fn start(spec: &PipelineSpec) -> Result<PipelineHandle, ProcessError> {
    if spec.stages.is_empty() {
        return Err(ProcessError::EmptyPipeline);
    }

    let mut handle = PipelineHandle {
        stages: Vec::with_capacity(spec.stages.len()),
        process_group: None,
        stdout: None,
        feed_task: None,
        started: Instant::now(),
        state: PipelineState::Running,
    };

    let mut upstream: Option<Stdio> = None;
    let mut first_stdin: Option<ChildStdin> = None;
    let last = spec.stages.len() - 1;

    for (i, command) in spec.stages.iter().enumerate() {
        let mut cmd = command.to_command(handle.process_group);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        match upstream.take() {
            Some(stdio) => cmd.stdin(stdio),
            None if spec.stdin.is_some() => cmd.stdin(Stdio::piped()),
            None => cmd.stdin(Stdio::null()),
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                handle.kill();
                return Err(ProcessError::Spawn {
                    program: command.display_name(),
                    source,
                });
            }
        };
        debug!("Started stage {} (pid {:?}): {}", i, child.id(), command);

        if handle.process_group.is_none() {
            handle.process_group = child.id();
        }
        if i == 0 {
            first_stdin = child.stdin.take();
        }

        let stderr = StderrTail::new(spec.stderr_tail_bytes);
        let stderr_task = child.stderr.take().map(|mut pipe| {
            let tail = stderr.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 2048];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => tail.push(&chunk[..n]),
                    }
                }
            })
        });

        if i < last {
            if let Some(out) = child.stdout.take() {
                let stdio: std::io::Result<Stdio> = out.try_into();
                match stdio {
                    Ok(stdio) => upstream = Some(stdio),
                    Err(e) => {
                        handle.stages.push(Stage {
                            program: command.display_name(),
                            child,
                            status: None,
                            stderr,
                            stderr_task,
                        });
                        handle.kill();
                        return Err(ProcessError::Io(e));
                    }
                }
            }
        } else {
            handle.stdout = child.stdout.take();
        }

        handle.stages.push(Stage {
            program: command.display_name(),
            child,
            status: None,
            stderr,
            stderr_task,
        });
    }

    if let (Some(feed), Some(stdin)) = (spec.stdin.clone(), first_stdin) {
        handle.feed_task = Some(tokio::spawn(async move {
            if let Err(e) = pump_stdin(stdin, feed).await {
                // The decoder may legitimately stop reading early
                debug!("stdin feed stopped: {}", e);
            }
        }));
    }

    info!(
        "Pipeline started: {} stage(s), process group {:?}",
        handle.stages.len(),
        handle.process_group
    );
    Ok(handle)
}

async fn pump_stdin(mut stdin: ChildStdin, feed: StdinFeed) -> std::io::Result<()> {
    match feed {
        StdinFeed::Bytes(bytes) => stdin.write_all(&bytes).await?,
        StdinFeed::FileSegment {
            prefix,
            path,
            start,
            end,
        } => {
            stdin.write_all(&prefix).await?;
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut segment = file.take(end.saturating_sub(start));
            tokio::io::copy(&mut segment, &mut stdin).await?;
        }
    }
    stdin.shutdown().await
}

/// Run a pipeline to completion and collect its stdout as text.
pub async fn run_to_string(spec: &PipelineSpec) -> Result<String, ProcessError> {
    let mut handle = start(spec)?;
    let mut output = Vec::new();
    if let Some(mut stdout) = handle.take_stdout() {
        stdout.read_to_end(&mut output).await?;
    }
    handle.wait().await?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}

impl PipelineHandle {
    /// The last stage's stdout; `None` once taken
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn process_group(&self) -> Option<u32> {
        self.process_group
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Pid of the first stage, if it is still known
    pub fn pid(&self) -> Result<u32, ProcessError> {
        self.stages
            .first()
            .and_then(|stage| stage.child.id())
            .ok_or(ProcessError::NotStarted)
    }

    fn refresh_running(&mut self) -> bool {
        if self.state != PipelineState::Running {
            return false;
        }
        let mut running = false;
        for stage in &mut self.stages {
            running |= !stage.poll_exited();
        }
        if !running {
            self.state = PipelineState::Exited;
        }
        running
    }

    /// Force-kill every stage. Safe to call any number of times.
    pub fn kill(&mut self) -> KillOutcome {
        if !self.refresh_running() {
            return KillOutcome::AlreadyExited;
        }
        warn!("Killing pipeline (process group {:?})", self.process_group);
        self.signal(Termination::Forced);
        self.state = PipelineState::Killed;
        KillOutcome::Signalled
    }

    /// Ask every stage to exit, then force-kill whatever is left after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> KillOutcome {
        if !self.refresh_running() {
            self.abort_feed();
            return KillOutcome::AlreadyExited;
        }
        debug!("Terminating pipeline (process group {:?})", self.process_group);
        self.signal(Termination::Graceful);
        self.state = PipelineState::Killed;

        if tokio::time::timeout(grace, self.reap()).await.is_err() {
            warn!(
                "Pipeline did not exit within {:?}, force-killing process group {:?}",
                grace, self.process_group
            );
            self.signal(Termination::Forced);
            self.reap().await;
        }
        self.abort_feed();
        KillOutcome::Signalled
    }

    fn signal(&mut self, mode: Termination) {
        let mut children: Vec<&mut Child> = self
            .stages
            .iter_mut()
            .filter(|stage| stage.status.is_none())
            .map(|stage| &mut stage.child)
            .collect();
        signal::terminate(self.process_group, &mut children, mode);
    }

    async fn reap(&mut self) {
        for stage in &mut self.stages {
            if stage.status.is_none() {
                match stage.child.wait().await {
                    Ok(status) => stage.status = Some(status),
                    Err(e) => debug!("wait on {} failed: {}", stage.program, e),
                }
            }
        }
    }

    fn abort_feed(&mut self) {
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }

    /// Wait for every stage to exit.
    ///
    /// A stage that exits with a failure status is reported together with the
    /// tail of its stderr, unless the pipeline was killed on purpose.
    pub async fn wait(&mut self) -> Result<(), ProcessError> {
        for stage in &mut self.stages {
            if stage.status.is_none() {
                stage.status = Some(stage.child.wait().await?);
            }
        }
        self.abort_feed();

        let killed = self.state == PipelineState::Killed;
        if !killed {
            self.state = PipelineState::Exited;
        }
        debug!("Pipeline finished after {:?}", self.elapsed());

        if killed {
            return Ok(());
        }
        for stage in &mut self.stages {
            let status = match stage.status {
                Some(status) if !status.success() => status,
                _ => continue,
            };
            if let Some(task) = stage.stderr_task.take() {
                // Forked children may hold the pipe open after the stage exits
                let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
            }
            return Err(ProcessError::AbnormalExit {
                program: stage.program.clone(),
                status: status.to_string(),
                stderr_tail: stage.stderr.contents(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("stages", &self.stages.iter().map(|s| &s.program).collect::<Vec<_>>())
            .field("process_group", &self.process_group)
            .field("state", &self.state)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.refresh_running() {
            warn!(
                "Pipeline dropped while running, killing process group {:?}",
                self.process_group
            );
            self.signal(Termination::Forced);
        }
        self.abort_feed();
        for stage in &mut self.stages {
            if let Some(task) = stage.stderr_task.take() {
                task.abort();
            }
        }
    }
}
