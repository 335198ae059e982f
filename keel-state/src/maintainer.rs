//! The state maintainer capability.

use keel_core::{ConsumerRecord, StartingOffsets};

/// Owner of the global stores fed by the state-consumption loop.
///
/// The maintainer is the sole authority over store contents and checkpoint
/// metadata. The loop only hands it records and checkpoint opportunities.
///
/// # Contract
///
/// - `initialize` is called exactly once, before any `update`, and returns
///   one starting offset per change-log partition to replay.
/// - `update` must tolerate records at or below the last checkpoint:
///   applying a record twice must leave the store as applying it once.
/// - `maybe_checkpoint` is offered once per poll cycle, after the whole
///   batch was applied. It decides by its own cadence whether to persist.
/// - `close(true)` deletes persisted state so that a fresh maintainer's
///   `initialize` reports offsets consistent with an empty store.
pub trait GlobalStateMaintainer: Send {
    /// Error raised by the maintainer.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens the stores and reports where replay resumes.
    ///
    /// # Errors
    /// Returns an error if the stores or checkpoint cannot be read.
    fn initialize(&mut self) -> Result<StartingOffsets, Self::Error>;

    /// Applies one record to the store fed by its partition.
    ///
    /// # Errors
    /// Returns an error if the record cannot be applied. The store may then
    /// be inconsistent and the loop stops.
    fn update(&mut self, record: &ConsumerRecord) -> Result<(), Self::Error>;

    /// Persists progress if enough time or volume has passed.
    ///
    /// # Errors
    /// Returns an error if flushing stores or writing the checkpoint fails.
    fn maybe_checkpoint(&mut self) -> Result<(), Self::Error>;

    /// Closes the stores, deleting persisted state if `wipe_state_store`.
    ///
    /// # Errors
    /// Returns an error if closing or wiping fails.
    fn close(&mut self, wipe_state_store: bool) -> Result<(), Self::Error>;
}
