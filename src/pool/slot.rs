//! Per-slot lifecycle state for a connection pool.
//!
//! Each slot in a pool's backing array carries one atomic state word instead
//! of being inferred from pool-wide counters. This lets `reserve`/`return`/
//! `kill`/`validate` and friends race against each other safely with a
//! compare-and-swap instead of holding the whole pool under one lock.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a single pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    /// Slot has never held a connection; its array entry is empty.
    NotInit = 0,
    /// A backend connection is being established for this slot.
    Init = 1,
    /// Slot holds a live, idle connection available for reservation.
    Free = 2,
    /// Slot is checked out by a client.
    InUse = 3,
    /// Checked out, but marked for removal instead of return (flush/max-age).
    Gracefully = 4,
    /// Idle slot being drained by a flush request.
    Flush = 5,
    /// Idle slot being examined for idle-timeout expiry.
    IdleCheck = 6,
    /// Slot being examined for exceeding its configured maximum age.
    MaxConnectionAge = 7,
    /// Idle slot running a liveness probe (EmptyQuery / ReadyForQuery).
    Validation = 8,
    /// Connection is being torn down; the slot returns to `NotInit` next.
    Remove = 9,
}

impl SlotState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotState::NotInit,
            1 => SlotState::Init,
            2 => SlotState::Free,
            3 => SlotState::InUse,
            4 => SlotState::Gracefully,
            5 => SlotState::Flush,
            6 => SlotState::IdleCheck,
            7 => SlotState::MaxConnectionAge,
            8 => SlotState::Validation,
            _ => SlotState::Remove,
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SlotState::NotInit => "notinit",
            SlotState::Init => "init",
            SlotState::Free => "free",
            SlotState::InUse => "in_use",
            SlotState::Gracefully => "gracefully",
            SlotState::Flush => "flush",
            SlotState::IdleCheck => "idle_check",
            SlotState::MaxConnectionAge => "max_connection_age",
            SlotState::Validation => "validation",
            SlotState::Remove => "remove",
        };
        write!(f, "{name}")
    }
}

/// All states a slot can be in, in the order `Status::slot_counts` reports them.
pub const ALL_STATES: [SlotState; 10] = [
    SlotState::NotInit,
    SlotState::Init,
    SlotState::Free,
    SlotState::InUse,
    SlotState::Gracefully,
    SlotState::Flush,
    SlotState::IdleCheck,
    SlotState::MaxConnectionAge,
    SlotState::Validation,
    SlotState::Remove,
];

/// An atomic cell holding one slot's [`SlotState`].
#[derive(Debug)]
pub struct SlotCell(AtomicU8);

impl SlotCell {
    pub fn new(state: SlotState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SlotState {
        SlotState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SlotState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Attempts `current -> new`. On failure returns the state actually observed.
    pub fn compare_exchange(&self, current: SlotState, new: SlotState) -> Result<(), SlotState> {
        match self.0.compare_exchange(
            current as u8,
            new as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => Err(SlotState::from_u8(observed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_snake_case() {
        assert_eq!(SlotState::IdleCheck.to_string(), "idle_check");
        assert_eq!(SlotState::MaxConnectionAge.to_string(), "max_connection_age");
        assert_eq!(SlotState::NotInit.to_string(), "notinit");
    }

    #[test]
    fn cas_fails_with_observed_state_on_mismatch() {
        let cell = SlotCell::new(SlotState::Free);
        let err = cell
            .compare_exchange(SlotState::InUse, SlotState::Free)
            .unwrap_err();
        assert_eq!(err, SlotState::Free);
    }

    #[test]
    fn cas_succeeds_and_updates_state() {
        let cell = SlotCell::new(SlotState::NotInit);
        cell.compare_exchange(SlotState::NotInit, SlotState::Init)
            .unwrap();
        assert_eq!(cell.load(), SlotState::Init);
    }

    #[test]
    fn roundtrip_through_all_states() {
        for state in ALL_STATES {
            assert_eq!(SlotState::from_u8(state as u8), state);
        }
    }
}
