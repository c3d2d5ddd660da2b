//! Time-ordered 64-bit ids for chat messages held by in-process stores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2025-01-01T00:00:00Z, in ms since the Unix epoch.
const EPOCH_MS: u64 = 1_735_689_600_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIME_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

/// Lock-free snowflake generator.
///
/// An id is `timestamp(42) | node(10) | sequence(12)`. The last issued
/// `timestamp | sequence` pair is kept in one atomic word, so ids from one
/// generator are strictly increasing even if the wall clock steps back.
pub struct SnowflakeGenerator {
    node: u64,
    /// `(ms since EPOCH_MS) << SEQUENCE_BITS | sequence` of the last id.
    last: AtomicU64,
}

impl SnowflakeGenerator {
    /// Only the low 10 bits of `node` are used.
    pub fn new(node: u16) -> Self {
        Self {
            node: u64::from(node) & NODE_MASK,
            last: AtomicU64::new(0),
        }
    }

    pub fn generate(&self) -> u64 {
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let now = elapsed_ms() << SEQUENCE_BITS;
            // Either a fresh millisecond or the next sequence slot after the
            // last id; overflowing the sequence borrows from the next ms.
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return self.compose(next),
                Err(actual) => last = actual,
            }
        }
    }

    fn compose(&self, stamp: u64) -> u64 {
        let ms = stamp >> SEQUENCE_BITS;
        let sequence = stamp & SEQUENCE_MASK;
        (ms << TIME_SHIFT) | (self.node << SEQUENCE_BITS) | sequence
    }
}

fn elapsed_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
        .saturating_sub(EPOCH_MS)
}

/// Unix time in ms at which `id` was issued.
pub fn issued_at_ms(id: u64) -> u64 {
    (id >> TIME_SHIFT) + EPOCH_MS
}
