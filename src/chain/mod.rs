//! Chain read capability.
//!
//! The tracker and the query service only ever see the `ChainReader` trait:
//! current height, decoded event logs for a block range, and view calls.
//! All operations are idempotent reads.
//!
//! - `RpcChainReader` (rpc.rs): alloy HTTP provider implementation
//! - `abi`: contract interfaces and event topics

pub mod abi;
#[cfg(test)]
pub(crate) mod mock;
pub mod rpc;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

pub use rpc::RpcChainReader;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// RPC/network failure. Retried by re-covering the range next iteration.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// Malformed response, reverted call, or unresolvable range/contract.
    #[error("chain client error: {0}")]
    Client(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Event streams the tracker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Factory: a new vault was deployed.
    VaultCreated,
    /// Vault: its total supply cap changed.
    SupplyCapUpdated,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::VaultCreated => write!(f, "VaultCreated"),
            EventKind::SupplyCapUpdated => write!(f, "TotalSupplyCapUpdated"),
        }
    }
}

/// Decoded event arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventArgs {
    VaultCreated { vault: Address, market: Address },
    SupplyCapUpdated { new_cap: U256 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub transaction_hash: Option<B256>,
    pub args: EventArgs,
}

/// View functions the tracker reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewCall {
    Name,
    Symbol,
    TotalSupply,
    TotalSupplyCap,
    Maturity,
    Market,
    TokenId,
    Account,
    /// Market: current time index.
    LatestTime,
    /// Hub: deposit-token address for a token id.
    TokenAddress { token_id: u16 },
    /// ERC-20 precision.
    Decimals,
}

impl std::fmt::Display for ViewCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewCall::Name => write!(f, "name()"),
            ViewCall::Symbol => write!(f, "symbol()"),
            ViewCall::TotalSupply => write!(f, "totalSupply()"),
            ViewCall::TotalSupplyCap => write!(f, "totalSupplyCap()"),
            ViewCall::Maturity => write!(f, "maturity()"),
            ViewCall::Market => write!(f, "market()"),
            ViewCall::TokenId => write!(f, "tokenId()"),
            ViewCall::Account => write!(f, "account()"),
            ViewCall::LatestTime => write!(f, "latestTime()"),
            ViewCall::TokenAddress { token_id } => write!(f, "tokenIdToAddress({})", token_id),
            ViewCall::Decimals => write!(f, "decimals()"),
        }
    }
}

/// A decoded view-call return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallValue {
    Uint(U256),
    Address(Address),
    Text(String),
    Word(B256),
}

impl CallValue {
    pub fn into_uint(self) -> Result<U256, ChainError> {
        match self {
            CallValue::Uint(v) => Ok(v),
            other => Err(ChainError::Client(format!("expected uint, got {:?}", other))),
        }
    }

    pub fn into_address(self) -> Result<Address, ChainError> {
        match self {
            CallValue::Address(a) => Ok(a),
            other => Err(ChainError::Client(format!("expected address, got {:?}", other))),
        }
    }

    pub fn into_text(self) -> Result<String, ChainError> {
        match self {
            CallValue::Text(s) => Ok(s),
            other => Err(ChainError::Client(format!("expected string, got {:?}", other))),
        }
    }

    pub fn into_word(self) -> Result<B256, ChainError> {
        match self {
            CallValue::Word(w) => Ok(w),
            other => Err(ChainError::Client(format!("expected bytes32, got {:?}", other))),
        }
    }
}

/// Read-only chain capability.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;

    /// Events of `kind` emitted by `contract` in `[from_block, to_block]`,
    /// in ascending block order.
    async fn get_events(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError>;

    async fn call(&self, contract: Address, call: ViewCall) -> Result<CallValue, ChainError>;
}

/// Typed helpers over `ChainReader::call`.
#[async_trait]
pub trait ChainReaderExt: ChainReader {
    async fn call_uint(&self, contract: Address, call: ViewCall) -> Result<U256, ChainError> {
        self.call(contract, call).await?.into_uint()
    }

    async fn call_address(&self, contract: Address, call: ViewCall) -> Result<Address, ChainError> {
        self.call(contract, call).await?.into_address()
    }

    async fn call_text(&self, contract: Address, call: ViewCall) -> Result<String, ChainError> {
        self.call(contract, call).await?.into_text()
    }

    async fn call_word(&self, contract: Address, call: ViewCall) -> Result<B256, ChainError> {
        self.call(contract, call).await?.into_word()
    }
}

impl<T: ChainReader + ?Sized> ChainReaderExt for T {}
