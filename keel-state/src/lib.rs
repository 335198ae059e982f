//! Keel State - Global state restoration and continuous update.
//!
//! This crate keeps a set of global stores current by replaying their
//! change-log partitions, from a known starting offset, for as long as the
//! worker runs.
//!
//! # Components
//!
//! - [`StateConsumer`]: the state-consumption loop. It asks a
//!   [`GlobalStateMaintainer`] where to resume, seeks a
//!   [`RecordSource`](keel_log::RecordSource) there, and then applies every
//!   polled record before offering one checkpoint opportunity per cycle.
//! - [`GlobalStateThread`]: runs a `StateConsumer` on a dedicated thread with
//!   a cross-thread [`ShutdownHandle`].
//! - [`StoreMaintainer`]: a maintainer backed by [`KeyValueStore`]s and an
//!   [`OffsetCheckpoint`] file in a state directory.
//!
//! # Lifecycle
//!
//! ```text
//! Created --initialize--> Initialized --poll_and_update--> Running
//!    |                        |                              |
//!    +------------------------+-----------close--------------+--> Closed
//! ```
//!
//! # Delivery
//!
//! Records are applied at least once. After a crash, records between the
//! last checkpoint and the crash are applied again, so `update` must be safe
//! to replay.
//!
//! # Example
//!
//! ```ignore
//! use keel_log::{LogConsumerConfig, MemoryLog};
//! use keel_state::{
//!     GlobalStateThread, GlobalStateThreadConfig, StateConsumer, StateConsumerConfig,
//!     StoreBinding, StoreMaintainer, StoreMaintainerConfig,
//! };
//!
//! let maintainer = StoreMaintainer::new(
//!     StoreMaintainerConfig::new("/var/lib/keel")
//!         .with_binding(StoreBinding::persistent("users", [users_changelog])),
//! )?;
//! let readers = maintainer.readers();
//! let consumer = StateConsumer::new(
//!     log.consumer(LogConsumerConfig::default()),
//!     maintainer,
//!     StateConsumerConfig::default(),
//! );
//!
//! let thread = GlobalStateThread::start(consumer, GlobalStateThreadConfig::default())?;
//! // ... serve reads from `readers` ...
//! thread.shutdown_handle().shutdown();
//! let summary = thread.join()?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod checkpoint;
mod clock;
mod consumer;
mod error;
mod maintainer;
mod store;
mod store_maintainer;
mod thread;

pub use checkpoint::{CheckpointConfig, OffsetCheckpoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{ConsumerState, PollSummary, StateConsumer, StateConsumerConfig};
pub use error::{
    BoxError, CheckpointError, CheckpointResult, InitializationError, MaintainerError,
    MaintainerResult, StateError, StateResult, StoreError, StoreResult,
};
pub use maintainer::GlobalStateMaintainer;
pub use store::{KeyValueStore, MemoryStore, SnapshotStore, StoreReader};
pub use store_maintainer::{StoreBinding, StoreMaintainer, StoreMaintainerConfig};
pub use thread::{
    GlobalStateThread, GlobalStateThreadConfig, RunSummary, ShutdownHandle, StateListener,
    ThreadState,
};
