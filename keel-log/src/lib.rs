//! Keel Log - Record sources for change-log replay.
//!
//! This crate defines the narrow capability the state-consumption loop needs
//! from a log client, and ships an in-memory implementation of it.
//!
//! # Record Source
//!
//! A [`RecordSource`] supports:
//! - `assign`: take exclusive ownership of a set of partitions
//! - `seek` / `position`: move and query the next offset to read
//! - `poll`: fetch a batch of records, blocking at most for a timeout
//! - `wakeup_handle`: let another thread interrupt a blocked poll
//! - `close`: release resources
//!
//! # In-Memory Log
//!
//! [`MemoryLog`] is a shared, replayable set of partitions that producers
//! append to. [`LogConsumer`] reads from it through the `RecordSource`
//! interface with exact seeks, retention-aware range checks and round-robin
//! fairness across partitions.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod consumer;
mod error;
mod memory;
mod source;

pub use consumer::{AutoOffsetReset, LogConsumer, LogConsumerConfig};
pub use error::{SourceError, SourceResult};
pub use memory::MemoryLog;
pub use source::{RecordSource, WakeupHandle};
