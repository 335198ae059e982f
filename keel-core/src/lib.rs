//! Keel Core - Shared types for global state restoration.
//!
//! This crate holds the vocabulary every other Keel crate speaks: change-log
//! partitions, offsets within them, the records read from them, and the
//! explicit limits that bound polling and storage.
//!
//! # Design Principles
//!
//! - **Value types**: `TopicPartition` and `Offset` are immutable and cheap
//!   to copy or clone, so they work as map keys.
//! - **Explicit limits**: every batch and buffer has a bounded maximum.
//! - **Opaque payloads**: keys and values are bytes; serialization lives
//!   above this layer.
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod record;
mod types;

pub use error::{Error, Result};
pub use limits::Limits;
pub use record::{ConsumerRecord, Timestamp};
pub use types::{Offset, StartPosition, StartingOffsets, TopicPartition};
