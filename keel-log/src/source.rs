//! The record source capability.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{ConsumerRecord, Offset, TopicPartition};

use crate::error::SourceResult;

/// A replayable, partitioned source of change-log records.
///
/// Implementations are driven from a single thread. The only cross-thread
/// entry point is the [`WakeupHandle`], which interrupts a blocked `poll`.
pub trait RecordSource: Send {
    /// Replaces the assignment with exactly `partitions`.
    ///
    /// # Errors
    /// Returns an error if any partition cannot be assigned.
    fn assign(&mut self, partitions: BTreeSet<TopicPartition>) -> SourceResult<()>;

    /// Returns the current assignment.
    fn assignment(&self) -> BTreeSet<TopicPartition>;

    /// Sets the next offset to read for an assigned partition.
    ///
    /// # Errors
    /// Returns an error if the partition is not assigned or the offset is
    /// outside the retained range.
    fn seek(&mut self, partition: &TopicPartition, offset: Offset) -> SourceResult<()>;

    /// Positions an assigned partition at its first retained offset and
    /// returns that offset.
    ///
    /// # Errors
    /// Returns an error if the partition is not assigned.
    fn seek_to_beginning(&mut self, partition: &TopicPartition) -> SourceResult<Offset>;

    /// Returns the next offset to read for an assigned partition.
    ///
    /// # Errors
    /// Returns an error if the partition is not assigned or has no position.
    fn position(&self, partition: &TopicPartition) -> SourceResult<Offset>;

    /// Fetches the next batch of records, blocking for at most `timeout`.
    ///
    /// Records of one partition come back in increasing offset order without
    /// gaps. The batch may be empty.
    ///
    /// # Errors
    /// Returns an error if the source is closed or a position is no longer
    /// retained.
    fn poll(&mut self, timeout: Duration) -> SourceResult<Vec<ConsumerRecord>>;

    /// Returns a handle that makes the current or next `poll` return early.
    fn wakeup_handle(&self) -> WakeupHandle;

    /// Releases the source. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns an error if releasing resources fails.
    fn close(&mut self) -> SourceResult<()>;

    /// Returns true once `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Cloneable handle that interrupts a blocked poll from another thread.
#[derive(Clone)]
pub struct WakeupHandle {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl WakeupHandle {
    /// Creates a handle that runs `wake` when fired.
    #[must_use]
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            wake: Arc::new(wake),
        }
    }

    /// Creates a handle that does nothing, for sources whose poll never blocks.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Fires the wakeup.
    pub fn wakeup(&self) {
        (self.wake)();
    }
}

impl fmt::Debug for WakeupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupHandle").finish_non_exhaustive()
    }
}
