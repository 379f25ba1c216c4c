//! alloy-backed `ChainReader` over HTTP JSON-RPC.
//!
//! Log queries are split into chunks to respect provider block-range limits.
//! RPC failures are classified into transient (retry next iteration) and
//! client errors (skip the affected vault/event).

use crate::chain::abi::{self, IERC20Metadata, IMarket, IMarketHub, IVault, IVaultFactory};
use crate::chain::{CallValue, ChainError, ChainEvent, ChainReader, EventArgs, EventKind, ViewCall};

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use tracing::{debug, warn};

/// JSON-RPC codes that mean the request itself is bad, not the transport.
const CLIENT_ERROR_CODES: [i64; 3] = [-32602, -32600, 3];

pub struct RpcChainReader {
    provider: RootProvider,
    log_chunk_size: u64,
}

impl RpcChainReader {
    pub fn new(rpc_url: &str, log_chunk_size: u64) -> anyhow::Result<Self> {
        let provider = RootProvider::new_http(rpc_url.parse()?);
        Ok(Self {
            provider,
            log_chunk_size: log_chunk_size.max(1),
        })
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(Bytes::from(data)));
        self.provider.call(tx).await.map_err(classify)
    }

    async fn call_typed<C: SolCall + Send>(
        &self,
        to: Address,
        call: C,
    ) -> Result<C::Return, ChainError> {
        let out = self.eth_call(to, call.abi_encode()).await?;
        C::abi_decode_returns(&out).map_err(|e| {
            ChainError::Client(format!("failed to decode {} from {}: {}", C::SIGNATURE, to, e))
        })
    }

    /// Query logs in chunks, preserving ascending block order.
    async fn get_logs_chunked(
        &self,
        base_filter: &Filter,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ChainError> {
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.log_chunk_size - 1).min(to);
            let filter = base_filter.clone().from_block(start).to_block(end);
            let logs = self.provider.get_logs(&filter).await.map_err(classify)?;
            debug!(from = start, to = end, logs = logs.len(), "fetched log chunk");
            all_logs.extend(logs);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        all_logs.sort_by_key(|l| (l.block_number.unwrap_or(0), l.log_index.unwrap_or(0)));
        Ok(all_logs)
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn current_height(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(classify)
    }

    async fn get_events(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        if from_block > to_block {
            return Ok(Vec::new());
        }
        let topic = match kind {
            EventKind::VaultCreated => abi::VAULT_CREATED_TOPIC,
            EventKind::SupplyCapUpdated => abi::SUPPLY_CAP_UPDATED_TOPIC,
        };
        let filter = Filter::new().address(contract).event_signature(topic);
        let logs = self.get_logs_chunked(&filter, from_block, to_block).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                continue;
            }
            match decode_log(&log, kind) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        contract = %contract,
                        kind = %kind,
                        block = log.block_number.unwrap_or(0),
                        error = %e,
                        "skipping undecodable log"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn call(&self, contract: Address, call: ViewCall) -> Result<CallValue, ChainError> {
        let value = match call {
            ViewCall::Name => CallValue::Text(self.call_typed(contract, IVault::nameCall {}).await?),
            ViewCall::Symbol => {
                CallValue::Text(self.call_typed(contract, IERC20Metadata::symbolCall {}).await?)
            }
            ViewCall::TotalSupply => {
                CallValue::Uint(self.call_typed(contract, IVault::totalSupplyCall {}).await?)
            }
            ViewCall::TotalSupplyCap => {
                CallValue::Uint(self.call_typed(contract, IVault::totalSupplyCapCall {}).await?)
            }
            ViewCall::Maturity => {
                CallValue::Uint(self.call_typed(contract, IVault::maturityCall {}).await?)
            }
            ViewCall::Market => {
                CallValue::Address(self.call_typed(contract, IVault::marketCall {}).await?)
            }
            ViewCall::TokenId => {
                let id = self.call_typed(contract, IVault::tokenIdCall {}).await?;
                CallValue::Uint(alloy::primitives::U256::from(id))
            }
            ViewCall::Account => {
                let word: B256 = self.call_typed(contract, IVault::accountCall {}).await?;
                CallValue::Word(word)
            }
            ViewCall::LatestTime => {
                CallValue::Uint(self.call_typed(contract, IMarket::latestTimeCall {}).await?)
            }
            ViewCall::TokenAddress { token_id } => CallValue::Address(
                self.call_typed(contract, IMarketHub::tokenIdToAddressCall { tokenId: token_id })
                    .await?,
            ),
            ViewCall::Decimals => {
                let decimals = self.call_typed(contract, IERC20Metadata::decimalsCall {}).await?;
                CallValue::Uint(alloy::primitives::U256::from(decimals))
            }
        };
        Ok(value)
    }
}

fn decode_log(log: &Log, kind: EventKind) -> Result<ChainEvent, ChainError> {
    let block_number = log
        .block_number
        .ok_or_else(|| ChainError::Client("log has no block number".to_string()))?;

    let args = match kind {
        EventKind::VaultCreated => {
            let decoded = log
                .log_decode::<IVaultFactory::VaultCreated>()
                .map_err(|e| ChainError::Client(e.to_string()))?;
            EventArgs::VaultCreated {
                vault: decoded.inner.data.vault,
                market: decoded.inner.data.market,
            }
        }
        EventKind::SupplyCapUpdated => {
            let decoded = log
                .log_decode::<IVault::TotalSupplyCapUpdated>()
                .map_err(|e| ChainError::Client(e.to_string()))?;
            EventArgs::SupplyCapUpdated {
                new_cap: decoded.inner.data.newTotalSupplyCap,
            }
        }
    };

    Ok(ChainEvent {
        block_number,
        transaction_hash: log.transaction_hash,
        args,
    })
}

/// Map an alloy transport error onto the chain error taxonomy.
fn classify(err: TransportError) -> ChainError {
    let msg = err.to_string();
    if let Some(payload) = err.as_error_resp() {
        let lower = payload.message.to_lowercase();
        if CLIENT_ERROR_CODES.contains(&payload.code) || lower.contains("execution reverted") {
            return ChainError::Client(msg);
        }
        return ChainError::Transient(msg);
    }
    if matches!(err, RpcError::DeserError { .. }) {
        return ChainError::Client(msg);
    }
    let is_rate_limited = msg.contains("429") || msg.contains("Too Many Requests");
    if is_rate_limited {
        debug!(error = %msg, "provider rate limited");
    }
    ChainError::Transient(msg)
}
