//! Dedicated thread driving a [`StateConsumer`].
//!
//! The thread owns the consumer for its whole life: it initializes it, runs
//! cycles until shutdown is requested or a fatal error occurs, and closes it.
//! Since `close` runs on the loop thread it never races an `update`.
//!
//! # States
//!
//! ```text
//! Created -> Starting -> Running -> PendingShutdown -> Dead
//!               |          |                           ^
//!               +----------+------- fatal error -------+
//! ```
//!
//! # Shutdown
//!
//! [`ShutdownHandle::shutdown`] sets a flag the loop checks before every
//! cycle and fires the source's wakeup, so a blocked poll returns at once
//! instead of running out its timeout.

#![allow(clippy::significant_drop_tightening)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use keel_log::{RecordSource, WakeupHandle};
use tracing::{error, info, warn};

use crate::consumer::StateConsumer;
use crate::error::{StateError, StateResult};
use crate::maintainer::GlobalStateMaintainer;

/// Lifecycle state of a [`GlobalStateThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Not started.
    Created,
    /// Initializing the consumer.
    Starting,
    /// Running poll cycles.
    Running,
    /// Stop requested; closing.
    PendingShutdown,
    /// Stopped. Terminal.
    Dead,
}

impl ThreadState {
    /// Returns true if the thread may move from `self` to `next`.
    #[must_use]
    pub const fn is_valid_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Running | Self::PendingShutdown | Self::Dead)
                | (Self::Running, Self::PendingShutdown | Self::Dead)
                | (Self::PendingShutdown, Self::Dead)
        )
    }

    /// Returns true until the thread is dead.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// Observer of [`ThreadState`] transitions.
///
/// Called on the loop thread after each transition; must not block.
pub trait StateListener: Send + Sync {
    /// Called after the state changed from `old` to `new`.
    fn on_change(&self, new: ThreadState, old: ThreadState);
}

/// Current state plus the listeners to notify on change.
struct StateCell {
    state: Mutex<ThreadState>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl StateCell {
    fn new(listeners: Vec<Arc<dyn StateListener>>) -> Self {
        Self {
            state: Mutex::new(ThreadState::Created),
            listeners,
        }
    }

    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    fn get(&self) -> ThreadState {
        *self.state.lock().expect("thread state lock poisoned")
    }

    /// Moves to `next`, returning false if the transition is not allowed.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    fn set(&self, next: ThreadState) -> bool {
        let old = {
            let mut state = self.state.lock().expect("thread state lock poisoned");
            let old = *state;
            if !old.is_valid_transition(next) {
                if old != next {
                    warn!(from = ?old, to = ?next, "Ignoring invalid thread state transition");
                }
                return false;
            }
            *state = next;
            old
        };

        for listener in &self.listeners {
            listener.on_change(next, old);
        }
        true
    }
}

/// Marks the thread dead when the loop exits, including by panic.
struct DeadOnDrop(Arc<StateCell>);

impl Drop for DeadOnDrop {
    fn drop(&mut self) {
        self.0.set(ThreadState::Dead);
    }
}

/// Configuration for a [`GlobalStateThread`].
#[derive(Clone)]
pub struct GlobalStateThreadConfig {
    /// OS thread name.
    pub thread_name: String,
    /// Wipe local state on a clean shutdown.
    pub wipe_on_close: bool,
    /// Stop after this many consecutive empty polls.
    pub max_idle_polls: Option<u32>,
    /// Observers of state transitions.
    pub listeners: Vec<Arc<dyn StateListener>>,
}

impl GlobalStateThreadConfig {
    /// Default OS thread name.
    pub const DEFAULT_THREAD_NAME: &'static str = "keel-global-state";

    /// Creates a config that runs until shut down.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_name: Self::DEFAULT_THREAD_NAME.to_string(),
            wipe_on_close: false,
            max_idle_polls: None,
            listeners: Vec::new(),
        }
    }

    /// Sets the OS thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Wipes local state on a clean shutdown.
    #[must_use]
    pub const fn with_wipe_on_close(mut self, wipe: bool) -> Self {
        self.wipe_on_close = wipe;
        self
    }

    /// Stops once `polls` consecutive polls returned nothing.
    #[must_use]
    pub const fn with_max_idle_polls(mut self, polls: u32) -> Self {
        self.max_idle_polls = Some(polls);
        self
    }

    /// Adds a state listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl Default for GlobalStateThreadConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GlobalStateThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalStateThreadConfig")
            .field("thread_name", &self.thread_name)
            .field("wipe_on_close", &self.wipe_on_close)
            .field("max_idle_polls", &self.max_idle_polls)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Cloneable handle that asks a [`GlobalStateThread`] to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wakeup: WakeupHandle,
}

impl ShutdownHandle {
    /// Requests shutdown and interrupts a blocked poll. Idempotent.
    pub fn shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Global state thread shutdown requested");
        }
        self.wakeup.wakeup();
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Totals of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Completed poll cycles.
    pub poll_cycles: u64,
    /// Records applied.
    pub records_applied: u64,
    /// True if the run stopped after `max_idle_polls` empty polls.
    pub caught_up: bool,
}

/// A [`StateConsumer`] running on its own thread.
///
/// Dropping the handle without calling [`join`](Self::join) requests
/// shutdown and waits for the loop to close the consumer.
pub struct GlobalStateThread {
    /// Taken by `join` or `drop`.
    handle: Option<JoinHandle<StateResult<RunSummary>>>,
    shutdown: ShutdownHandle,
    state: Arc<StateCell>,
}

impl GlobalStateThread {
    /// Spawns the loop thread and waits for the consumer to initialize.
    ///
    /// # Errors
    /// Returns `ThreadSpawn` if the thread cannot be created, or the
    /// initialization error after the consumer was closed. An
    /// out-of-range starting offset closes with wipe so the next start
    /// rebuilds from scratch.
    pub fn start<S, M>(
        consumer: StateConsumer<S, M>,
        config: GlobalStateThreadConfig,
    ) -> StateResult<Self>
    where
        S: RecordSource + 'static,
        M: GlobalStateMaintainer + 'static,
    {
        let state = Arc::new(StateCell::new(config.listeners.clone()));
        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            wakeup: consumer.wakeup_handle(),
        };
        let (started_tx, started_rx) = mpsc::sync_channel(1);

        let handle = {
            let state = Arc::clone(&state);
            let requested = Arc::clone(&shutdown.requested);
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || run(consumer, &config, &requested, state, &started_tx))
                .map_err(StateError::ThreadSpawn)?
        };

        if started_rx.recv().is_ok() {
            return Ok(Self {
                handle: Some(handle),
                shutdown,
                state,
            });
        }

        // The loop exited before initializing; its result carries why.
        match handle.join() {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) | Err(_) => Err(StateError::ThreadPanicked),
        }
    }

    /// Returns a handle that stops the thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    /// Returns true once the thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the thread to exit.
    ///
    /// # Errors
    /// Returns the fatal error that stopped the loop, a close error, or
    /// `ThreadPanicked`.
    pub fn join(mut self) -> StateResult<RunSummary> {
        self.handle
            .take()
            .ok_or(StateError::ThreadPanicked)?
            .join()
            .map_err(|_| StateError::ThreadPanicked)?
    }
}

impl Drop for GlobalStateThread {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.shutdown.shutdown();
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Global state thread dropped after failure"),
            Err(_) => warn!("Global state thread panicked"),
        }
    }
}

impl fmt::Debug for GlobalStateThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalStateThread")
            .field("state", &self.state())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// Loop thread body.
fn run<S, M>(
    mut consumer: StateConsumer<S, M>,
    config: &GlobalStateThreadConfig,
    requested: &AtomicBool,
    state: Arc<StateCell>,
    started: &mpsc::SyncSender<()>,
) -> StateResult<RunSummary>
where
    S: RecordSource,
    M: GlobalStateMaintainer,
{
    state.set(ThreadState::Starting);
    let state = DeadOnDrop(state);

    if let Err(e) = consumer.initialize() {
        let wipe = e.is_offset_out_of_range() || config.wipe_on_close;
        error!(error = %e, wipe, "Global state initialization failed");
        if let Err(close_error) = consumer.close(wipe) {
            warn!(error = %close_error, "Close after failed initialization also failed");
        }
        return Err(e);
    }

    state.0.set(ThreadState::Running);
    // The receiver only goes away if `start` itself is gone.
    let _ = started.send(());
    info!("Global state thread running");

    let mut idle_polls = 0_u32;
    let mut caught_up = false;

    // Bounded loop: each iteration blocks at most one poll timeout, and
    // shutdown both sets the flag and interrupts the poll.
    let outcome = loop {
        if requested.load(Ordering::SeqCst) {
            break Ok(());
        }

        match consumer.poll_and_update() {
            Ok(summary) if summary.is_empty() => {
                idle_polls = idle_polls.saturating_add(1);
                if config.max_idle_polls.is_some_and(|max| idle_polls >= max) {
                    info!(idle_polls, "Global stores caught up");
                    caught_up = true;
                    break Ok(());
                }
            }
            Ok(_) => idle_polls = 0,
            Err(e) => break Err(e),
        }
    };

    let summary = RunSummary {
        poll_cycles: consumer.poll_cycles(),
        records_applied: consumer.records_applied(),
        caught_up,
    };

    match outcome {
        Ok(()) => {
            state.0.set(ThreadState::PendingShutdown);
            consumer.close(config.wipe_on_close)?;
            info!(
                poll_cycles = summary.poll_cycles,
                records_applied = summary.records_applied,
                "Global state thread stopped"
            );
            Ok(summary)
        }
        Err(e) => {
            let wipe = e.is_offset_out_of_range() || config.wipe_on_close;
            error!(error = %e, wipe, "Global state thread failed");
            if let Err(close_error) = consumer.close(wipe) {
                warn!(error = %close_error, "Close after fatal error also failed");
            }
            Err(e)
        }
    }
}
