//! # Socket state tracking
//!
//! Boolean socket attributes (relay, plug, load, overload) are debounced
//! before the cached state and event stream see them. Each attribute keeps a
//! `{current, pending}` pair: a change propagates to `pending` on the tick
//! that observes it and reaches `current` one tick later, provided the
//! observation did not revert in between. A single-tick glitch therefore
//! never surfaces.

use heapless::Vec;

use crate::acc::AccChannel;
use crate::config::{SockInfo, ACC_CHAN_MAX};
use crate::status::{SockFlags, SockStatus};

/// Tri-valued boolean, `Init` until the first observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolState {
    Init,
    False,
    True,
}

impl From<bool> for BoolState {
    fn from(value: bool) -> Self {
        if value { BoolState::True } else { BoolState::False }
    }
}

/// Change-of-state tracker implementing the 1-tick debounce
#[derive(Debug, Clone, Copy)]
pub struct StateChange {
    cur: BoolState,
    pending: BoolState,
}

impl Default for StateChange {
    fn default() -> Self {
        Self { cur: BoolState::Init, pending: BoolState::Init }
    }
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Present debounced state
    pub fn is_true(&self) -> bool {
        self.cur == BoolState::True
    }

    /// Feed one observation. Returns the new debounced state when it
    /// changed, `None` otherwise.
    ///
    /// The first observation after init passes straight through without
    /// reporting a change.
    pub fn observe(&mut self, value: bool) -> Option<bool> {
        let value = BoolState::from(value);

        if self.cur == BoolState::Init {
            self.cur = value;
            self.pending = value;
            return None;
        }

        if self.pending != value {
            // New observation, hold it for one tick
            self.pending = value;
            return None;
        }

        if self.cur != self.pending {
            // Observation held for a full tick, promote it
            self.cur = self.pending;
            return Some(self.cur == BoolState::True);
        }

        None
    }
}

/// Per-socket control block
pub struct SockCtrl {
    /// Identity and command codes from configuration
    pub info: SockInfo,
    /// Cached status handed to API callers
    pub status: SockStatus,
    /// Status flag byte from the most recent report
    pub last_flags: SockFlags,
    pub relay_active: StateChange,
    pub plug_detect: StateChange,
    pub load_active: StateChange,
    pub overload: StateChange,
    /// Second-resolution timestamp of the last relay change of state
    pub cos_time_relay: u32,
    /// Second-resolution timestamp of the last load change of state
    pub cos_time_load: u32,
    /// Channel 0 tracks the load; the rest belong to the application
    pub acc: Vec<AccChannel, ACC_CHAN_MAX>,
}

impl SockCtrl {
    pub fn new(info: SockInfo, num_acc_chan: usize) -> Self {
        let mut acc = Vec::new();
        for _ in 0..num_acc_chan {
            // Capacity checked at config validation
            let _ = acc.push(AccChannel::new());
        }
        Self {
            info,
            status: SockStatus::default(),
            last_flags: SockFlags(0),
            relay_active: StateChange::new(),
            plug_detect: StateChange::new(),
            load_active: StateChange::new(),
            overload: StateChange::new(),
            cos_time_relay: 0,
            cos_time_load: 0,
            acc,
        }
    }
}
