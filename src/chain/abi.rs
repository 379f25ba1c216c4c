//! Contract interfaces and event topic hashes.
//!
//! Minimal ABIs covering just the events and view functions the tracker
//! reads. Topic constants come from the `sol!` event definitions; startup
//! cross-checks them against keccak256 of the canonical signatures.

use alloy::primitives::{keccak256, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    /// Factory that deploys vaults.
    interface IVaultFactory {
        event VaultCreated(address indexed vault, address indexed market);
    }

    /// Capped pooled-deposit vault.
    interface IVault {
        event TotalSupplyCapUpdated(uint256 newTotalSupplyCap);

        function name() external view returns (string);
        function symbol() external view returns (string);
        function totalSupply() external view returns (uint256);
        function totalSupplyCap() external view returns (uint256);
        function maturity() external view returns (uint256);
        function market() external view returns (address);
        function tokenId() external view returns (uint16);
        function account() external view returns (bytes32);
    }

    /// Market paired with a vault; reports the current time index.
    interface IMarket {
        function latestTime() external view returns (uint256);
    }

    /// Hub resolving token ids to deposit-token contracts.
    interface IMarketHub {
        function tokenIdToAddress(uint16 tokenId) external view returns (address);
    }

    interface IERC20Metadata {
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// keccak256("VaultCreated(address,address)")
pub const VAULT_CREATED_TOPIC: B256 = IVaultFactory::VaultCreated::SIGNATURE_HASH;

/// keccak256("TotalSupplyCapUpdated(uint256)")
pub const SUPPLY_CAP_UPDATED_TOPIC: B256 = IVault::TotalSupplyCapUpdated::SIGNATURE_HASH;

/// Verify that our topic hashes match the event signatures.
/// Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks = vec![
        ("VaultCreated(address,address)", VAULT_CREATED_TOPIC),
        ("TotalSupplyCapUpdated(uint256)", SUPPLY_CAP_UPDATED_TOPIC),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| (sig.to_string(), keccak256(sig.as_bytes()) == expected))
        .collect()
}
