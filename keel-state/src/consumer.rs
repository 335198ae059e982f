//! The state-consumption loop.
//!
//! A [`StateConsumer`] couples one [`RecordSource`] with one
//! [`GlobalStateMaintainer`]. The owner calls `initialize` once, then
//! `poll_and_update` until it wants to stop, then `close`.
//!
//! # Cycle
//!
//! ```text
//! poll(timeout) --> update(r1) .. update(rN) --> maybe_checkpoint()
//! ```
//!
//! Every record of a batch is applied before the single checkpoint
//! opportunity of that cycle, so a checkpoint never observes a half-applied
//! batch.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use keel_core::{StartPosition, StartingOffsets, TopicPartition};
use keel_log::{RecordSource, WakeupHandle};
use tracing::{debug, info, trace, warn};

use crate::error::{BoxError, InitializationError, StateError, StateResult};
use crate::maintainer::GlobalStateMaintainer;

/// Configuration for a [`StateConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateConsumerConfig {
    /// Longest a single poll may block.
    pub poll_timeout: Duration,
}

impl StateConsumerConfig {
    /// Creates a config with the given poll timeout.
    #[must_use]
    pub const fn new(poll_timeout: Duration) -> Self {
        Self { poll_timeout }
    }

    /// Creates a config with a short poll timeout for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Default for StateConsumerConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Lifecycle state of a [`StateConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, not yet initialized.
    Created,
    /// Positioned at the starting offsets, no cycle run yet.
    Initialized,
    /// At least one cycle has run.
    Running,
    /// Closed. Terminal.
    Closed,
}

impl ConsumerState {
    /// Returns true if `poll_and_update` may be called.
    #[must_use]
    pub const fn can_poll(self) -> bool {
        matches!(self, Self::Initialized | Self::Running)
    }
}

/// What one `poll_and_update` cycle applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Records applied.
    pub records: usize,
    /// Records applied per partition.
    pub partitions: BTreeMap<TopicPartition, usize>,
}

impl PollSummary {
    /// Returns true if the poll returned nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Keeps global stores current by replaying their change-log partitions.
#[derive(Debug)]
pub struct StateConsumer<S, M> {
    source: S,
    maintainer: M,
    config: StateConsumerConfig,
    state: ConsumerState,
    records_applied: u64,
    poll_cycles: u64,
}

impl<S, M> StateConsumer<S, M>
where
    S: RecordSource,
    M: GlobalStateMaintainer,
{
    /// Creates a consumer. Nothing is touched until `initialize`.
    #[must_use]
    pub const fn new(source: S, maintainer: M, config: StateConsumerConfig) -> Self {
        Self {
            source,
            maintainer,
            config,
            state: ConsumerState::Created,
            records_applied: 0,
            poll_cycles: 0,
        }
    }

    /// Assigns and positions the source at the maintainer's starting offsets.
    ///
    /// [`StartPosition::Earliest`] resolves to the first offset the log
    /// still retains. Every [`StartPosition::At`] offset is sought exactly:
    /// one the source cannot seek to is a fatal error and is never replaced
    /// by another one.
    ///
    /// # Errors
    /// Returns `InvalidState` unless freshly created, or `Initialization`
    /// if the maintainer, the assignment or a seek fails.
    pub fn initialize(&mut self) -> StateResult<StartingOffsets> {
        if self.state != ConsumerState::Created {
            return Err(StateError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        let starting = self
            .maintainer
            .initialize()
            .map_err(|e| InitializationError::Maintainer(Box::new(e)))?;

        let partitions: BTreeSet<TopicPartition> = starting.keys().cloned().collect();
        self.source
            .assign(partitions)
            .map_err(InitializationError::Assign)?;

        for (partition, &position) in &starting {
            match position {
                StartPosition::Earliest => {
                    let offset = self.source.seek_to_beginning(partition).map_err(|source| {
                        InitializationError::SeekToBeginning {
                            partition: partition.clone(),
                            source,
                        }
                    })?;
                    debug!(
                        partition = %partition,
                        offset = offset.get(),
                        "Resolved earliest offset"
                    );
                }
                StartPosition::At(offset) => {
                    self.source.seek(partition, offset).map_err(|source| {
                        InitializationError::Seek {
                            partition: partition.clone(),
                            offset,
                            source,
                        }
                    })?;
                }
            }
        }

        debug_assert_eq!(self.source.assignment().len(), starting.len());

        self.state = ConsumerState::Initialized;
        info!(
            partitions = starting.len(),
            "Global state consumer initialized"
        );
        for (partition, position) in &starting {
            debug!(partition = %partition, position = %position, "Starting position");
        }

        Ok(starting)
    }

    /// Runs one cycle: one bounded poll, one `update` per record in delivery
    /// order, then one checkpoint opportunity.
    ///
    /// # Errors
    /// Returns `InvalidState` outside `Initialized`/`Running`, `Poll` if the
    /// source fails, `Apply` if a record cannot be applied (the rest of the
    /// batch is skipped and no checkpoint is offered), or `Checkpoint`.
    pub fn poll_and_update(&mut self) -> StateResult<PollSummary> {
        if !self.state.can_poll() {
            return Err(StateError::InvalidState {
                operation: "poll_and_update",
                state: self.state,
            });
        }
        self.state = ConsumerState::Running;

        let records = self
            .source
            .poll(self.config.poll_timeout)
            .map_err(StateError::Poll)?;

        let mut summary = PollSummary::default();
        for record in &records {
            self.maintainer
                .update(record)
                .map_err(|e| StateError::Apply {
                    partition: record.partition.clone(),
                    offset: record.offset,
                    source: Box::new(e),
                })?;

            summary.records += 1;
            *summary
                .partitions
                .entry(record.partition.clone())
                .or_default() += 1;
            self.records_applied += 1;
        }

        self.maintainer
            .maybe_checkpoint()
            .map_err(|e| StateError::Checkpoint(Box::new(e)))?;
        self.poll_cycles += 1;

        if summary.is_empty() {
            trace!(cycle = self.poll_cycles, "Poll cycle returned no records");
        } else {
            debug!(
                cycle = self.poll_cycles,
                records = summary.records,
                partitions = summary.partitions.len(),
                "Applied batch"
            );
        }

        Ok(summary)
    }

    /// Closes the source and then the maintainer, wiping local state if
    /// `wipe_state_store` is set.
    ///
    /// Both are attempted regardless of the other's outcome and the consumer
    /// always ends up `Closed`. Closing again is a no-op.
    ///
    /// # Errors
    /// Returns `Close` carrying whichever collaborators failed.
    pub fn close(&mut self, wipe_state_store: bool) -> StateResult<()> {
        if self.state == ConsumerState::Closed {
            return Ok(());
        }
        self.state = ConsumerState::Closed;

        let source_error = self.source.close().err();
        if let Some(e) = &source_error {
            warn!(error = %e, "Failed to close record source");
        }

        let maintainer_error = self.maintainer.close(wipe_state_store).err();
        if let Some(e) = &maintainer_error {
            warn!(error = %e, "Failed to close state maintainer");
        }

        info!(
            wipe = wipe_state_store,
            records_applied = self.records_applied,
            poll_cycles = self.poll_cycles,
            "Global state consumer closed"
        );

        if source_error.is_none() && maintainer_error.is_none() {
            return Ok(());
        }
        Err(StateError::Close {
            source_error,
            maintainer_error: maintainer_error.map(|e| -> BoxError { Box::new(e) }),
        })
    }

    /// Returns a handle that interrupts a blocked poll from another thread.
    #[must_use]
    pub fn wakeup_handle(&self) -> WakeupHandle {
        self.source.wakeup_handle()
    }
}

impl<S, M> StateConsumer<S, M> {
    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConsumerState {
        self.state
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &StateConsumerConfig {
        &self.config
    }

    /// Returns the record source.
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Returns the record source mutably.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Returns the state maintainer.
    #[must_use]
    pub const fn maintainer(&self) -> &M {
        &self.maintainer
    }

    /// Returns the state maintainer mutably.
    pub fn maintainer_mut(&mut self) -> &mut M {
        &mut self.maintainer
    }

    /// Total records applied since creation.
    #[must_use]
    pub const fn records_applied(&self) -> u64 {
        self.records_applied
    }

    /// Total completed poll cycles since creation.
    #[must_use]
    pub const fn poll_cycles(&self) -> u64 {
        self.poll_cycles
    }
}
