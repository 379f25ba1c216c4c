//! Vault data model and status derivation.
//!
//! A vault's status is never stored as a source of truth. `Filled` and
//! `Expired` are recomputed from cap/supply/maturity/time on every
//! inspection; `VaultRecord::is_filled` is a cache of the last evaluation.
//!
//! All large integers (cap, supply, maturity) serialize as decimal strings so
//! the snapshot file round-trips without precision loss.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Basis points per 100%.
const BPS_SCALE: u64 = 10_000;

/// Utilization threshold in integer basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillThreshold {
    bps: u64,
}

impl FillThreshold {
    /// `floor(pct * 100)`, tolerant of float noise like `99.99 * 100 = 9998.999…`.
    pub fn from_pct(pct: f64) -> Self {
        let scaled = pct * 100.0;
        let rounded = scaled.round();
        let bps = if (scaled - rounded).abs() < 1e-6 {
            rounded
        } else {
            scaled.floor()
        };
        Self {
            bps: bps.max(0.0) as u64,
        }
    }

    pub fn bps(&self) -> u64 {
        self.bps
    }

    /// `floor(supply * 10000 / cap) >= bps`, evaluated as the equivalent
    /// `supply * 10000 >= bps * cap`. A zero cap is never filled.
    pub fn is_filled(&self, supply: U256, cap: U256) -> bool {
        if cap.is_zero() {
            return false;
        }
        let scale = U256::from(BPS_SCALE);
        let bps = U256::from(self.bps);
        match (supply.checked_mul(scale), cap.checked_mul(bps)) {
            (Some(lhs), Some(rhs)) => lhs >= rhs,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            // Both sides past 2^256: compare on the high halves
            (None, None) => (supply >> 128usize) * scale >= (cap >> 128usize) * bps,
        }
    }
}

/// Filled predicate on a percentage threshold.
pub fn is_filled(supply: U256, cap: U256, threshold_pct: f64) -> bool {
    FillThreshold::from_pct(threshold_pct).is_filled(supply, cap)
}

/// A vault is expired once its market's time index reaches maturity.
pub fn is_expired(latest_time: U256, maturity: U256) -> bool {
    latest_time >= maturity
}

/// Display-only utilization percentage.
pub fn utilization_pct(supply: U256, cap: U256) -> f64 {
    if cap.is_zero() {
        return 0.0;
    }
    to_f64(supply) / to_f64(cap) * 100.0
}

/// Lossy conversion for display arithmetic.
pub fn to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

/// Lower-case, 0x-prefixed address string used as the store key.
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", alloy::hex::encode(address.as_slice()))
}

/// Derived per-vault status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Live,
    Filled,
    Expired,
}

impl VaultStatus {
    pub fn derive(
        latest_time: U256,
        maturity: U256,
        supply: U256,
        cap: U256,
        threshold: FillThreshold,
    ) -> Self {
        if is_expired(latest_time, maturity) {
            VaultStatus::Expired
        } else if threshold.is_filled(supply, cap) {
            VaultStatus::Filled
        } else {
            VaultStatus::Live
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, VaultStatus::Live)
    }
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultStatus::Live => write!(f, "live"),
            VaultStatus::Filled => write!(f, "filled"),
            VaultStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Cap and supply observed together, with the fill flag evaluated against them.
///
/// The only way to set a record's capacity fields, so `is_filled` can never
/// drift from the cap/supply it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub cap: U256,
    pub supply: U256,
    pub is_filled: bool,
}

impl Capacity {
    pub fn new(cap: U256, supply: U256, threshold: FillThreshold) -> Self {
        Self {
            cap,
            supply,
            is_filled: threshold.is_filled(supply, cap),
        }
    }
}

/// Last-known state of one vault contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultRecord {
    pub address: String,
    pub name: String,
    pub symbol: String,
    #[serde(with = "dec_u256")]
    pub total_supply_cap: U256,
    #[serde(with = "dec_u256")]
    pub last_known_total_supply: U256,
    #[serde(with = "dec_u256")]
    pub maturity: U256,
    pub market_address: String,
    pub is_filled: bool,
    pub last_checked_block: u64,
    /// Unix seconds when the record was first written.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_token_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_token_decimals: Option<u8>,
    /// Opaque per-vault account id (hex), used for auxiliary balance lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl VaultRecord {
    pub fn capacity(&self) -> Capacity {
        Capacity {
            cap: self.total_supply_cap,
            supply: self.last_known_total_supply,
            is_filled: self.is_filled,
        }
    }

    pub fn set_capacity(&mut self, capacity: Capacity) {
        self.total_supply_cap = capacity.cap;
        self.last_known_total_supply = capacity.supply;
        self.is_filled = capacity.is_filled;
    }

    pub fn vault_address(&self) -> Option<Address> {
        Address::from_str(&self.address).ok()
    }

    pub fn market(&self) -> Option<Address> {
        Address::from_str(&self.market_address).ok()
    }

    pub fn utilization_pct(&self) -> f64 {
        utilization_pct(self.last_known_total_supply, self.total_supply_cap)
    }

    pub fn needs_metadata(&self) -> bool {
        self.deposit_token_symbol.is_none()
            || self.deposit_token_decimals.is_none()
            || self.account_id.is_none()
    }

    /// Apply a partial update. Optional metadata is only filled when absent.
    pub fn apply(&mut self, patch: &VaultPatch) {
        if let Some(capacity) = patch.capacity {
            self.set_capacity(capacity);
        }
        if let Some(block) = patch.last_checked_block {
            self.last_checked_block = self.last_checked_block.max(block);
        }
        if self.deposit_token_symbol.is_none() {
            self.deposit_token_symbol = patch.deposit_token_symbol.clone();
        }
        if self.deposit_token_decimals.is_none() {
            self.deposit_token_decimals = patch.deposit_token_decimals;
        }
        if self.account_id.is_none() {
            self.account_id = patch.account_id.clone();
        }
    }
}

/// Partial update for an existing vault record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VaultPatch {
    pub capacity: Option<Capacity>,
    pub last_checked_block: Option<u64>,
    pub deposit_token_symbol: Option<String>,
    pub deposit_token_decimals: Option<u8>,
    pub account_id: Option<String>,
}

impl VaultPatch {
    pub fn capacity(capacity: Capacity, block: u64) -> Self {
        Self {
            capacity: Some(capacity),
            last_checked_block: Some(block),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The persisted aggregate snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub last_processed_block: u64,
    #[serde(default)]
    pub vaults: BTreeMap<String, VaultRecord>,
}

/// Serde adapter: U256 as a decimal string.
pub mod dec_u256 {
    use alloy::primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(s.trim(), 10).map_err(D::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn sample_record(address: &str, cap: u64, supply: u64, maturity: u64) -> VaultRecord {
    let threshold = FillThreshold::from_pct(98.0);
    let capacity = Capacity::new(U256::from(cap), U256::from(supply), threshold);
    VaultRecord {
        address: address.to_lowercase(),
        name: "Test Vault".to_string(),
        symbol: "TV".to_string(),
        total_supply_cap: capacity.cap,
        last_known_total_supply: capacity.supply,
        maturity: U256::from(maturity),
        market_address: "0x00000000000000000000000000000000000000aa".to_string(),
        is_filled: capacity.is_filled,
        last_checked_block: 0,
        created_at: 0,
        deposit_token_symbol: None,
        deposit_token_decimals: None,
        account_id: None,
    }
}
