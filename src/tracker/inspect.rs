//! Transition evaluation for a single vault.
//!
//! Compares a freshly observed cap/supply/time against the stored record.
//! The previous fill state is recomputed from the stored cap and supply, not
//! read from the cached `is_filled` flag.

use crate::vault::{is_expired, Capacity, FillThreshold, VaultRecord};
use alloy::primitives::U256;

/// Fresh on-chain reading of a vault's mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub cap: U256,
    pub supply: U256,
    pub latest_time: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CapRaised { old_cap: U256, new_cap: U256 },
    Filled,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub capacity: Capacity,
    pub expired: bool,
    /// Empty when expired.
    pub transitions: Vec<Transition>,
}

impl Inspection {
    /// Whether cap, supply, or the fill state differ from `prev`.
    pub fn capacity_changed(&self, prev: &VaultRecord) -> bool {
        self.capacity != prev.capacity()
    }
}

pub fn evaluate(prev: &VaultRecord, obs: Observation, threshold: FillThreshold) -> Inspection {
    let capacity = Capacity::new(obs.cap, obs.supply, threshold);
    let expired = is_expired(obs.latest_time, prev.maturity);
    if expired {
        return Inspection {
            capacity,
            expired,
            transitions: Vec::new(),
        };
    }

    let was_filled = threshold.is_filled(prev.last_known_total_supply, prev.total_supply_cap);
    let mut transitions = Vec::new();
    if obs.cap != prev.total_supply_cap {
        transitions.push(Transition::CapRaised {
            old_cap: prev.total_supply_cap,
            new_cap: obs.cap,
        });
    }
    match (was_filled, capacity.is_filled) {
        (true, false) => transitions.push(Transition::Available),
        (false, true) => transitions.push(Transition::Filled),
        _ => {}
    }

    Inspection {
        capacity,
        expired,
        transitions,
    }
}
