#![forbid(unsafe_code)]

//! Stream id allocation. Initial ids are odd, reply ids clear the low bit.

use std::sync::atomic::{AtomicU64, Ordering};

/// Supplies fresh initial stream ids and derives their reply ids.
pub trait IdGenerator: Send + Sync {
    fn next_initial_id(&self, routed_id: u64) -> u64;
    fn reply_id(&self, initial_id: u64) -> u64;
}

pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 0x01 != 0
}

/// Counter-backed generator, safe to share between sessions.
#[derive(Debug, Default)]
pub struct DefaultIdGenerator {
    counter: AtomicU64,
}

impl DefaultIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocation after `start`, e.g. to keep clear of ids a frontend transport uses.
    pub fn starting_at(start: u64) -> Self {
        Self { counter: AtomicU64::new(start & !0x01) }
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn next_initial_id(&self, _routed_id: u64) -> u64 {
        (self.counter.fetch_add(2, Ordering::Relaxed) + 2) | 0x01
    }

    fn reply_id(&self, initial_id: u64) -> u64 {
        initial_id & !0x01
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_ids_odd_and_unique() {
        let ids = DefaultIdGenerator::new();
        let a = ids.next_initial_id(1);
        let b = ids.next_initial_id(1);
        assert!(is_initial(a) && is_initial(b));
        assert_ne!(a, b);
        assert_eq!(ids.reply_id(a), a - 1);
        assert!(!is_initial(ids.reply_id(b)));
    }

    #[test]
    fn test_starting_at() {
        let ids = DefaultIdGenerator::starting_at(1000);
        assert_eq!(ids.next_initial_id(0), 1003);
        assert_eq!(ids.next_initial_id(0), 1005);
    }
}
