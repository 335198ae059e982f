//! Consumer reading from a [`MemoryLog`].
//!
//! The consumer handles:
//! - Assignment of an explicit partition set
//! - Exact seeks, validated against the retained range
//! - Bounded, blocking polls with round-robin fairness across partitions
//! - Wakeup from another thread
//!
//! # Auto-Offset Reset
//!
//! Newly assigned partitions get an initial position from the reset policy:
//! - `Earliest`: the log start offset
//! - `Latest`: the log end offset (only new records)
//! - `None`: no position until an explicit seek

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::{ConsumerRecord, Limits, Offset, TopicPartition};
use tracing::{debug, info, trace};

use crate::error::{SourceError, SourceResult};
use crate::memory::{MemoryLog, PartitionLog};
use crate::source::{RecordSource, WakeupHandle};

/// Auto-offset reset policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoOffsetReset {
    /// Start from the earliest available offset.
    #[default]
    Earliest,
    /// Start from the latest offset (only new records).
    Latest,
    /// Require an explicit seek.
    None,
}

/// Configuration for a [`LogConsumer`].
#[derive(Debug, Clone, Default)]
pub struct LogConsumerConfig {
    /// Position policy for newly assigned partitions.
    pub auto_offset_reset: AutoOffsetReset,
    /// Poll and assignment limits.
    pub limits: Limits,
}

impl LogConsumerConfig {
    /// Creates a config with default limits and the given reset policy.
    #[must_use]
    pub fn new(auto_offset_reset: AutoOffsetReset) -> Self {
        Self {
            auto_offset_reset,
            limits: Limits::new(),
        }
    }

    /// Sets the maximum number of records returned by one poll.
    #[must_use]
    pub const fn with_max_poll_records(mut self, max_poll_records: u32) -> Self {
        self.limits.max_poll_records = max_poll_records;
        self
    }
}

/// A [`RecordSource`] over a [`MemoryLog`].
#[derive(Debug)]
pub struct LogConsumer {
    /// Log being read.
    log: MemoryLog,
    /// Configuration.
    config: LogConsumerConfig,
    /// Assigned partitions, sorted.
    assigned: Vec<TopicPartition>,
    /// Next offset to read per assigned partition.
    positions: HashMap<TopicPartition, Offset>,
    /// Index into `assigned` where the next poll starts.
    next_partition: usize,
    /// Set by the wakeup handle, cleared by the poll that observes it.
    wakeup: Arc<AtomicBool>,
    /// Whether the consumer is closed.
    closed: bool,
}

impl LogConsumer {
    /// Creates a consumer over `log`.
    #[must_use]
    pub fn new(log: MemoryLog, config: LogConsumerConfig) -> Self {
        Self {
            log,
            config,
            assigned: Vec::new(),
            positions: HashMap::new(),
            next_partition: 0,
            wakeup: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    /// Returns the consumer configuration.
    #[must_use]
    pub const fn config(&self) -> &LogConsumerConfig {
        &self.config
    }

    /// Returns how many records remain between the position and the log end.
    ///
    /// # Errors
    /// Returns an error if the partition is not assigned or has no position.
    pub fn lag(&self, partition: &TopicPartition) -> SourceResult<u64> {
        let position = self.position(partition)?;
        let end = self
            .log
            .log_end_offset(partition)
            .ok_or_else(|| SourceError::UnknownPartition {
                partition: partition.clone(),
            })?;
        Ok(end.distance_from(position))
    }

    fn ensure_open(&self) -> SourceResult<()> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    fn ensure_assigned(&self, partition: &TopicPartition) -> SourceResult<()> {
        if self.assigned.binary_search(partition).is_err() {
            return Err(SourceError::NotAssigned {
                partition: partition.clone(),
            });
        }
        Ok(())
    }

    /// Checks every assigned position against the retained range.
    fn validate_positions(
        &self,
        partitions: &HashMap<TopicPartition, PartitionLog>,
    ) -> SourceResult<()> {
        for tp in &self.assigned {
            let position = self
                .positions
                .get(tp)
                .copied()
                .ok_or_else(|| SourceError::NoPosition {
                    partition: tp.clone(),
                })?;
            let log = partitions
                .get(tp)
                .ok_or_else(|| SourceError::UnknownPartition {
                    partition: tp.clone(),
                })?;
            if !log.contains_position(position) {
                return Err(SourceError::OffsetOutOfRange {
                    partition: tp.clone(),
                    offset: position,
                    start: log.start(),
                    end: log.end(),
                });
            }
        }
        Ok(())
    }

    /// Reads one batch, visiting partitions round-robin.
    ///
    /// Positions must have been validated under the same lock.
    fn collect(
        &mut self,
        partitions: &HashMap<TopicPartition, PartitionLog>,
    ) -> Vec<ConsumerRecord> {
        let count = self.assigned.len();
        let max = self.config.limits.max_poll_records as usize;
        let mut records = Vec::new();
        let mut served_first = None;

        // Bounded loop: visits each assigned partition at most once.
        for step in 0..count {
            let remaining = max.saturating_sub(records.len());
            if remaining == 0 {
                break;
            }

            let idx = (self.next_partition + step) % count;
            let tp = &self.assigned[idx];
            let (Some(&position), Some(log)) = (self.positions.get(tp), partitions.get(tp)) else {
                continue;
            };

            let batch = log.read(tp, position, remaining);
            if let Some(last) = batch.last() {
                self.positions.insert(tp.clone(), last.offset.next());
                served_first.get_or_insert(idx);
            }
            records.extend(batch);
        }

        if let Some(idx) = served_first {
            self.next_partition = (idx + 1) % count;
        }

        // Postcondition: batch within limit.
        debug_assert!(records.len() <= max);
        records
    }
}

impl RecordSource for LogConsumer {
    fn assign(&mut self, partitions: BTreeSet<TopicPartition>) -> SourceResult<()> {
        self.ensure_open()?;

        let max = self.config.limits.max_assigned_partitions;
        if partitions.len() > max as usize {
            return Err(SourceError::TooManyPartitions {
                count: partitions.len(),
                max,
            });
        }

        let mut positions = HashMap::with_capacity(partitions.len());
        {
            let logs = self.log.shared().lock();
            for tp in &partitions {
                let log = logs.get(tp).ok_or_else(|| SourceError::UnknownPartition {
                    partition: tp.clone(),
                })?;

                let position = self.positions.get(tp).copied().or(match self
                    .config
                    .auto_offset_reset
                {
                    AutoOffsetReset::Earliest => Some(log.start()),
                    AutoOffsetReset::Latest => Some(log.end()),
                    AutoOffsetReset::None => None,
                });
                if let Some(position) = position {
                    positions.insert(tp.clone(), position);
                }
            }
        }

        self.assigned = partitions.into_iter().collect();
        self.positions = positions;
        self.next_partition = 0;

        debug!(partitions = self.assigned.len(), "Assigned partitions");
        Ok(())
    }

    fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.assigned.iter().cloned().collect()
    }

    fn seek(&mut self, partition: &TopicPartition, offset: Offset) -> SourceResult<()> {
        self.ensure_open()?;
        self.ensure_assigned(partition)?;

        {
            let logs = self.log.shared().lock();
            let log = logs
                .get(partition)
                .ok_or_else(|| SourceError::UnknownPartition {
                    partition: partition.clone(),
                })?;
            if !log.contains_position(offset) {
                return Err(SourceError::OffsetOutOfRange {
                    partition: partition.clone(),
                    offset,
                    start: log.start(),
                    end: log.end(),
                });
            }
        }

        self.positions.insert(partition.clone(), offset);
        debug!(partition = %partition, offset = offset.get(), "Seeked partition");
        Ok(())
    }

    fn seek_to_beginning(&mut self, partition: &TopicPartition) -> SourceResult<Offset> {
        self.ensure_open()?;
        self.ensure_assigned(partition)?;

        let start = self
            .log
            .log_start_offset(partition)
            .ok_or_else(|| SourceError::UnknownPartition {
                partition: partition.clone(),
            })?;
        self.positions.insert(partition.clone(), start);
        debug!(partition = %partition, offset = start.get(), "Seeked partition to beginning");
        Ok(start)
    }

    fn position(&self, partition: &TopicPartition) -> SourceResult<Offset> {
        self.ensure_open()?;
        self.ensure_assigned(partition)?;
        self.positions
            .get(partition)
            .copied()
            .ok_or_else(|| SourceError::NoPosition {
                partition: partition.clone(),
            })
    }

    fn poll(&mut self, timeout: Duration) -> SourceResult<Vec<ConsumerRecord>> {
        self.ensure_open()?;

        let deadline = Instant::now().checked_add(timeout);
        let shared = Arc::clone(self.log.shared());
        let mut partitions = shared.lock();

        loop {
            if self.wakeup.swap(false, Ordering::AcqRel) {
                trace!("Poll woken up");
                return Ok(Vec::new());
            }

            self.validate_positions(&partitions)?;
            let records = self.collect(&partitions);
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if deadline > now => deadline - now,
                Some(_) => return Ok(Vec::new()),
                // Overflowing deadline: wait in bounded slices until woken.
                None => Duration::from_secs(1),
            };

            let (guard, _) = shared
                .appended()
                .wait_timeout(partitions, wait)
                .expect("memory log lock poisoned");
            partitions = guard;
        }
    }

    fn wakeup_handle(&self) -> WakeupHandle {
        let flag = Arc::clone(&self.wakeup);
        let shared = Arc::clone(self.log.shared());
        WakeupHandle::new(move || {
            flag.store(true, Ordering::Release);
            shared.notify_all();
        })
    }

    fn close(&mut self) -> SourceResult<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.assigned.clear();
        self.positions.clear();
        info!("Log consumer closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
