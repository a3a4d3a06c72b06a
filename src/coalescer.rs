//! # Ingest Batching
//!
//! Buffers a fixed-size window of incoming observations and deduplicates it
//! in memory by forward key before the window is handed to the storage
//! engine, so a burst of repeated sightings costs one read-merge-write.
//!
//! A window is released when it reaches `capacity` raw inputs, or when the
//! flush deadline armed by the first buffered input expires.

use crate::model::{InputObservation, ObservationKey};
use hashbrown::HashMap;
use std::time::{Duration, Instant};

/// Batching knobs for one ingest consumer.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Raw inputs buffered before a forced flush.
    pub capacity: usize,
    /// Longest time a buffered input waits for its batch.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: crate::config::DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(crate::config::DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

impl BatchConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Default::default()
        }
    }
}

/// Deduplicating batch buffer.
pub struct ObservationBatcher {
    pending: HashMap<ObservationKey, InputObservation>,
    /// Raw inputs absorbed into `pending` since the last flush.
    window: usize,
    config: BatchConfig,
    deadline: Option<Instant>,
    total_inputs: u64,
    total_flushes: u64,
    total_committed: u64,
}

impl ObservationBatcher {
    pub fn new() -> Self {
        Self::with_config(BatchConfig::default())
    }

    pub fn with_config(config: BatchConfig) -> Self {
        Self {
            pending: HashMap::with_capacity(config.capacity),
            window: 0,
            config,
            deadline: None,
            total_inputs: 0,
            total_flushes: 0,
            total_committed: 0,
        }
    }

    /// Buffer one input, merging it into any pending sighting of the same
    /// key. Returns the deduplicated batch once the window is full.
    pub fn add(&mut self, input: InputObservation) -> Option<Vec<InputObservation>> {
        if self.window == 0 {
            self.deadline = Some(Instant::now() + self.config.flush_interval);
        }
        self.window += 1;
        self.total_inputs += 1;

        let input = input.normalized();
        match self.pending.entry(input.key()) {
            hashbrown::hash_map::Entry::Occupied(mut slot) => slot.get_mut().absorb(&input),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(input);
            }
        }

        if self.window >= self.config.capacity {
            self.flush()
        } else {
            None
        }
    }

    /// Release whatever is buffered.
    pub fn flush(&mut self) -> Option<Vec<InputObservation>> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        self.window = 0;
        self.total_flushes += 1;
        let batch: Vec<InputObservation> = self.pending.drain().map(|(_, obs)| obs).collect();
        self.total_committed += batch.len() as u64;
        Some(batch)
    }

    /// Flush only if the deadline has passed.
    pub fn tick(&mut self) -> Option<Vec<InputObservation>> {
        if self.is_deadline_passed() {
            self.flush()
        } else {
            None
        }
    }

    /// Time until the pending window must be flushed, if one is open.
    pub fn time_until_deadline(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Distinct keys pending.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            total_inputs: self.total_inputs,
            total_flushes: self.total_flushes,
            total_committed: self.total_committed,
            pending_keys: self.pending.len(),
        }
    }
}

impl Default for ObservationBatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    /// Raw inputs accepted.
    pub total_inputs: u64,
    pub total_flushes: u64,
    /// Distinct keys handed out across all flushes.
    pub total_committed: u64,
    pub pending_keys: usize,
}
