//! Generation tokens and cancellation.
//!
//! Every load attempt gets a generation from a single atomic counter. Work
//! started for a generation carries its tag; whatever leaves the loader is
//! compared against the counter and dropped when stale. Starting a generation
//! cancels the previous one's token without waiting for its teardown.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::Generation;

/// Lock-free source of generation numbers. Generation 0 means "none yet".
#[derive(Debug, Default)]
pub struct GenerationCounter {
    current: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next generation and make it current
    pub fn advance(&self) -> Generation {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Generation {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        generation != 0 && self.current() == generation
    }
}

/// A payload produced under one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<T> {
    pub generation: Generation,
    pub payload: T,
}

impl<T> Tagged<T> {
    pub fn new(generation: Generation, payload: T) -> Self {
        Self {
            generation,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading(Generation),
    Completed(Generation),
    Cancelled(Generation),
    Failed(Generation),
}

impl LoadState {
    pub fn generation(&self) -> Option<Generation> {
        match *self {
            LoadState::Idle => None,
            LoadState::Loading(g)
            | LoadState::Completed(g)
            | LoadState::Cancelled(g)
            | LoadState::Failed(g) => Some(g),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading(_))
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

/// Permission to run work for one generation.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub generation: Generation,
    /// Stops the generation's summary pipeline; fires on stop and on supersession
    pub cancel: CancellationToken,
    /// Fires only once a newer generation exists (or everything is cancelled)
    pub superseded: CancellationToken,
}

impl Ticket {
    fn new(generation: Generation) -> Self {
        let superseded = CancellationToken::new();
        Self {
            generation,
            cancel: superseded.child_token(),
            superseded,
        }
    }
}

/// Held by every running pipeline; dropping it marks the pipeline terminal.
#[derive(Debug)]
pub struct PipelineLease {
    live: Arc<AtomicUsize>,
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-loader state machine: Idle → Loading(g) → {Completed, Cancelled, Failed}(g).
#[derive(Debug)]
pub struct Coordinator {
    counter: Arc<GenerationCounter>,
    state: Mutex<LoadState>,
    active: Mutex<Option<Ticket>>,
    live_pipelines: Arc<AtomicUsize>,
}

impl Coordinator {
    pub fn new(counter: Arc<GenerationCounter>) -> Self {
        Self {
            counter,
            state: Mutex::new(LoadState::Idle),
            active: Mutex::new(None),
            live_pipelines: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> &Arc<GenerationCounter> {
        &self.counter
    }

    /// Start a new generation, cancelling the current one.
    pub fn begin(&self) -> Ticket {
        let mut active = self.active.lock();
        let generation = self.counter.advance();
        if let Some(previous) = active.take() {
            debug!(
                "Generation {} supersedes generation {}",
                generation, previous.generation
            );
            previous.superseded.cancel();
        }
        let ticket = Ticket::new(generation);
        *active = Some(ticket.clone());
        *self.state.lock() = LoadState::Loading(generation);
        ticket
    }

    /// The ticket of the current generation, if one is active
    pub fn current(&self) -> Option<Ticket> {
        self.active.lock().clone()
    }

    pub fn state(&self) -> LoadState {
        *self.state.lock()
    }

    /// Whether a payload may still be delivered
    pub fn accepts<T>(&self, tagged: &Tagged<T>) -> bool {
        self.counter.is_current(tagged.generation)
    }

    /// Hand `tagged` to `send` only if its generation is still current.
    ///
    /// This is the single exit point for generation-tagged output. The check
    /// and the send happen under the same lock `begin` takes, so nothing from
    /// a generation is sent once a newer one has been minted.
    pub fn deliver<T>(&self, tagged: Tagged<T>, send: impl FnOnce(Tagged<T>)) -> bool {
        let _active = self.active.lock();
        if !self.counter.is_current(tagged.generation) {
            return false;
        }
        send(tagged);
        true
    }

    /// Record how `generation` ended. Stale generations are ignored.
    pub fn finish(&self, generation: Generation, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if *state != LoadState::Loading(generation) || !self.counter.is_current(generation) {
            return false;
        }
        *state = match outcome {
            Outcome::Completed => LoadState::Completed(generation),
            Outcome::Cancelled => LoadState::Cancelled(generation),
            Outcome::Failed => LoadState::Failed(generation),
        };
        true
    }

    /// Stop the running load without superseding it.
    ///
    /// Rows already delivered stay valid and the generation stays current, so
    /// detail requests for it keep working. The state becomes
    /// `Cancelled(g)` once the load's task reports back.
    pub fn stop(&self) -> Option<Generation> {
        let active = self.active.lock();
        let ticket = active.as_ref()?;
        if *self.state.lock() != LoadState::Loading(ticket.generation) {
            return None;
        }
        debug!("Stopping generation {}", ticket.generation);
        ticket.cancel.cancel();
        Some(ticket.generation)
    }

    /// Cancel the current generation and return to Idle.
    ///
    /// The counter still advances so nothing from the cancelled generation is
    /// delivered afterwards.
    pub fn cancel_all(&self) -> Option<Generation> {
        let mut active = self.active.lock();
        let cancelled = active.take().map(|ticket| {
            ticket.superseded.cancel();
            ticket.generation
        });
        self.counter.advance();
        *self.state.lock() = LoadState::Idle;
        cancelled
    }

    /// Track a pipeline until the lease is dropped
    pub fn lease(&self) -> PipelineLease {
        self.live_pipelines.fetch_add(1, Ordering::SeqCst);
        PipelineLease {
            live: self.live_pipelines.clone(),
        }
    }

    /// Pipelines that have not reached a terminal state
    pub fn live_pipelines(&self) -> usize {
        self.live_pipelines.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_counter_is_unique_across_threads() {
        let counter = Arc::new(GenerationCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1000).map(|_| counter.advance()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for g in handle.join().unwrap() {
                assert!(seen.insert(g));
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(counter.current(), 8000);
        assert!(!counter.is_current(0));
    }

    #[test]
    fn test_begin_cancels_previous() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        assert_eq!(coordinator.state(), LoadState::Idle);

        let first = coordinator.begin();
        assert_eq!(coordinator.state(), LoadState::Loading(first.generation));
        let second = coordinator.begin();

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(second.generation, first.generation + 1);
        assert!(!coordinator.accepts(&Tagged::new(first.generation, ())));
        assert!(coordinator.accepts(&Tagged::new(second.generation, ())));
    }

    #[test]
    fn test_stale_finish_is_ignored() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        let first = coordinator.begin();
        let second = coordinator.begin();

        assert!(!coordinator.finish(first.generation, Outcome::Failed));
        assert_eq!(coordinator.state(), LoadState::Loading(second.generation));

        assert!(coordinator.finish(second.generation, Outcome::Completed));
        assert_eq!(coordinator.state(), LoadState::Completed(second.generation));
        assert!(!coordinator.finish(second.generation, Outcome::Failed));
    }

    #[test]
    fn test_deliver_drops_stale() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        let first = coordinator.begin();
        let mut sent = Vec::new();
        assert!(coordinator.deliver(Tagged::new(first.generation, 1), |t| sent.push(t.payload)));
        let second = coordinator.begin();
        assert!(!coordinator.deliver(Tagged::new(first.generation, 2), |t| sent.push(t.payload)));
        assert!(coordinator.deliver(Tagged::new(second.generation, 3), |t| sent.push(t.payload)));
        assert_eq!(sent, vec![1, 3]);
    }

    #[test]
    fn test_cancel_all_returns_to_idle() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        let ticket = coordinator.begin();
        assert_eq!(coordinator.cancel_all(), Some(ticket.generation));
        assert!(ticket.cancel.is_cancelled());
        assert_eq!(coordinator.state(), LoadState::Idle);
        assert!(!coordinator.accepts(&Tagged::new(ticket.generation, ())));
        assert!(coordinator.current().is_none());
    }

    #[test]
    fn test_stop_keeps_generation_current() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        let ticket = coordinator.begin();

        assert_eq!(coordinator.stop(), Some(ticket.generation));
        assert!(ticket.cancel.is_cancelled());
        assert!(!ticket.superseded.is_cancelled());
        assert!(coordinator.accepts(&Tagged::new(ticket.generation, ())));

        assert!(coordinator.finish(ticket.generation, Outcome::Cancelled));
        assert_eq!(coordinator.state(), LoadState::Cancelled(ticket.generation));
        // Nothing left to stop
        assert_eq!(coordinator.stop(), None);

        let next = coordinator.begin();
        assert!(ticket.superseded.is_cancelled());
        assert!(!next.cancel.is_cancelled());
    }

    #[test]
    fn test_leases() {
        let coordinator = Coordinator::new(Arc::new(GenerationCounter::new()));
        let a = coordinator.lease();
        let b = coordinator.lease();
        assert_eq!(coordinator.live_pipelines(), 2);
        drop(a);
        assert_eq!(coordinator.live_pipelines(), 1);
        drop(b);
        assert_eq!(coordinator.live_pipelines(), 0);
    }
}
