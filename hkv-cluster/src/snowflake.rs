//! # Snowflake Transaction IDs
//!
//! Purpose: 64-bit globally unique transaction ids for TCC coordination:
//! `(timestamp_ms: 42 bits, machine: 10 bits, sequence: 12 bits)`.
//! Uniqueness across peers follows from distinct machine bits, derived
//! from hashing the local peer's `host:port`; the generator is seeded once
//! at construction from the process start time rather than reseeded per call.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MACHINE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
const MACHINE_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + MACHINE_BITS;

fn machine_id(peer_addr: &str) -> u64 {
    (hkv_common::fnv1a32(peer_addr.as_bytes()) as u64) % (1 << MACHINE_BITS)
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Generates monotonically-ordered ids; `last: (timestamp, sequence)`
/// packed into one atomic so `next_id` needs no separate lock.
pub struct SnowflakeGenerator {
    machine_id: u64,
    last: AtomicI64,
}

impl SnowflakeGenerator {
    /// Seeds the generator from `peer_addr`'s hash; matches §4.8's "seeded
    /// from the local peer address."
    pub fn new(peer_addr: &str) -> Self {
        SnowflakeGenerator { machine_id: machine_id(peer_addr), last: AtomicI64::new(-1) }
    }

    pub fn next_id(&self) -> u64 {
        loop {
            let now = now_millis();
            let prev = self.last.load(Ordering::Acquire);
            let prev_ts = prev >> 12;
            let prev_seq = prev & MAX_SEQUENCE;

            let (ts, seq) = if now > prev_ts {
                (now, 0)
            } else if prev_seq < MAX_SEQUENCE {
                (prev_ts, prev_seq + 1)
            } else {
                // Sequence exhausted within this millisecond; spin to the next tick.
                continue;
            };

            let packed = (ts << 12) | seq;
            if self.last.compare_exchange(prev, packed, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return ((ts as u64) << TIMESTAMP_SHIFT) | (self.machine_id << MACHINE_SHIFT) | (seq as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = SnowflakeGenerator::new("127.0.0.1:7000");
        let mut prev = 0;
        for _ in 0..1000 {
            let id = gen.next_id();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn different_peers_get_different_machine_bits() {
        let a = SnowflakeGenerator::new("peer-a:1");
        let b = SnowflakeGenerator::new("peer-b:2");
        let mask = ((1u64 << MACHINE_BITS) - 1) << MACHINE_SHIFT;
        assert_ne!(a.next_id() & mask, b.next_id() & mask);
    }
}
