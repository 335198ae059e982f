//! Keel Tests - Integration tests for global state restoration.
//!
//! Tests here wire the real collaborators together: a [`MemoryLog`]
//! consumer as the record source and a [`StoreMaintainer`] over a temporary
//! state directory.
//!
//! ## Test Organization
//!
//! - `state_consumer_tests`: the consumption loop over real collaborators
//! - `restart_tests`: checkpoint resume, wipe and retention across restarts
//! - `global_thread_tests`: the loop thread, shutdown and fatal errors
//!
//! **Support Modules**:
//! - `fixtures`: partitions, seeded logs and a fault-injecting record source
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`
//!
//! [`MemoryLog`]: keel_log::MemoryLog
//! [`StoreMaintainer`]: keel_state::StoreMaintainer

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod fixtures;

#[cfg(test)]
mod state_consumer_tests;
