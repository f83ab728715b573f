//! Correlation id generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates process-unique correlation ids.
///
/// Ids are `<prefix>-<counter>` where the prefix is drawn randomly once per
/// generator and the counter increments atomically, so ids from two processes
/// talking to the same server do not collide and ids from one generator never
/// repeat.
///
/// ```
/// use meshwire_core::CorrelationIdGenerator;
///
/// let ids = CorrelationIdGenerator::new();
/// let a = ids.next_id();
/// let b = ids.next_id();
/// assert_ne!(a, b);
/// ```
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    prefix: u64,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    /// New generator with a random prefix.
    pub fn new() -> Self {
        Self {
            prefix: rand::random::<u64>(),
            counter: AtomicU64::new(1),
        }
    }

    /// Next id.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{}", self.prefix, n)
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
