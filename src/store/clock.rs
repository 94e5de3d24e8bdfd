//! Per-writer weak logical clocks.
//!
//! A weak clock packs the writer's IPv4 address and a per-process counter
//! into one u64. It orders writes from the *same* writer to the *same*
//! key only; writes from different writers are deliberately unordered
//! (full vector clocks were rejected for cost).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct WeakClock(u64);

impl WeakClock {
    /// Sentinel for values that never got stamped (boot-time system
    /// values).
    pub const NONE: WeakClock = WeakClock(0);

    pub fn new(writer: Ipv4Addr, counter: u32) -> Self {
        WeakClock(((u32::from(writer) as u64) << 32) | counter as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        WeakClock(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn writer(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.0 >> 32) as u32)
    }

    pub fn counter(&self) -> u32 {
        self.0 as u32
    }

    pub fn same_writer(&self, other: &WeakClock) -> bool {
        (self.0 >> 32) == (other.0 >> 32)
    }

    /// True iff this stamp provably precedes `other`: same writer,
    /// smaller counter. Different writers never happen-before each other.
    pub fn happens_before(&self, other: &WeakClock) -> bool {
        self.same_writer(other) && self.counter() < other.counter()
    }
}
