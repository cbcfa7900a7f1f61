//! Platform-specific termination.
//!
//! On unix the whole process group is signalled, which also reaches children
//! forked by a stage (shell wrappers, capture helpers). Elsewhere only the
//! tracked children can be reached.

use tokio::process::Child;
use tracing::debug;

#[cfg(unix)]
use crate::error::ProcessError;

/// How hard to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM to the group; the stages may clean up
    Graceful,
    /// SIGKILL to the group
    Forced,
}

#[cfg(unix)]
fn signal_group(pgid: u32, mode: Termination) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match mode {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcessError::NotStarted),
        Err(e) => Err(ProcessError::Io(e.into())),
    }
}

#[cfg(unix)]
pub(crate) fn terminate(process_group: Option<u32>, children: &mut [&mut Child], mode: Termination) {
    if let Some(pgid) = process_group {
        match signal_group(pgid, mode) {
            Ok(()) => debug!("Sent {:?} to process group {}", mode, pgid),
            Err(ProcessError::NotStarted) => debug!("Process group {} already gone", pgid),
            Err(e) => debug!("Signalling process group {} failed: {}", pgid, e),
        }
    }
    if mode == Termination::Forced {
        // A stage that left the group still dies with its tracked pid
        for child in children.iter_mut() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate(_process_group: Option<u32>, children: &mut [&mut Child], mode: Termination) {
    for child in children.iter_mut() {
        if let Err(e) = child.start_kill() {
            debug!("{:?} termination of {:?} failed: {}", mode, child.id(), e);
        }
    }
}
