use std::time::Duration;

use crate::utils::clock;

pub use crate::pool::slot::{SlotState, ALL_STATES};

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Maximum number of slots in the pool. This is the pool's limit rule:
    /// `reserve()` refuses checkouts past this count instead of queuing.
    pub max_size: usize,

    /// Minimum number of slots kept warm by `prefill()`.
    pub min_size: usize,

    /// Timeouts applied to pool operations.
    pub timeouts: Timeouts,
}

impl PoolConfig {
    /// Creates a new PoolConfig without any timeouts and with the provided max_size.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            min_size: 0,
            timeouts: Timeouts::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(num_cpus::get_physical() * 4)
    }
}

/// Timeouts applied to pool operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timeouts {
    /// Timeout when creating a new backend connection (`Init`).
    pub create: Option<Duration>,

    /// Timeout when probing a slot during `validate()`.
    pub validate: Option<Duration>,
}

impl Timeouts {
    /// Create an empty Timeouts config (no timeouts set).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The current pool status, reported to the control plane and admin console.
#[derive(Clone, Copy, Debug)]
pub struct Status {
    /// The maximum size of the pool.
    pub max_size: usize,

    /// The current number of initialized slots (anything past `NotInit`).
    pub size: usize,

    /// The number of slots currently `Free`.
    pub available: usize,

    /// Reservations currently blocked waiting for a slot.
    ///
    /// Always zero: `reserve()` never queues. A pool at capacity returns
    /// `POOL_FULL` immediately instead of parking the caller, so there is no
    /// waiter population to report. Kept so existing `SHOW POOLS`/control
    /// plane consumers don't need a schema change.
    pub waiting: usize,

    /// Per-[`SlotState`] breakdown across every slot in the pool.
    pub slots: [usize; 10],
}

impl Status {
    /// Breaks this pool's slots down by every [`SlotState`], in declaration order.
    pub fn slot_counts(&self) -> [(SlotState, usize); 10] {
        std::array::from_fn(|i| (ALL_STATES[i], self.slots[i]))
    }
}

/// Statistics regarding a connection held by a slot.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct Metrics {
    /// The instant when this connection was created.
    pub created: quanta::Instant,
    /// The instant when this connection was last returned to `Free`.
    pub recycled: Option<quanta::Instant>,
    /// The number of times this slot's connection has been reserved.
    pub recycle_count: usize,
}

impl Metrics {
    /// Age of the underlying connection, since it was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time elapsed since the slot was last returned to `Free`.
    pub fn last_used(&self) -> Duration {
        self.recycled.unwrap_or(self.created).elapsed()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            created: clock::now(),
            recycled: None,
            recycle_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_counts_preserves_declaration_order() {
        let mut slots = [0usize; 10];
        slots[SlotState::Free as usize] = 3;
        slots[SlotState::InUse as usize] = 4;
        let status = Status {
            max_size: 10,
            size: 7,
            available: 3,
            waiting: 0,
            slots,
        };
        let counts: std::collections::HashMap<_, _> = status.slot_counts().into_iter().collect();
        assert_eq!(counts[&SlotState::Free], 3);
        assert_eq!(counts[&SlotState::InUse], 4);
        assert_eq!(counts[&SlotState::NotInit], 0);
    }
}
