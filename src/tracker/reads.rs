//! Chain reads shared by the tracker and the live-vault query.

use crate::chain::{ChainError, ChainReader, ChainReaderExt, ViewCall};
use crate::tracker::inspect::Observation;
use crate::vault::{normalize_address, Capacity, FillThreshold, VaultPatch, VaultRecord};
use alloy::primitives::{Address, U256};
use tracing::debug;

fn parse_market(record: &VaultRecord) -> Result<Address, ChainError> {
    record.market().ok_or_else(|| {
        ChainError::Client(format!(
            "vault {} has invalid market address {}",
            record.address, record.market_address
        ))
    })
}

fn parse_vault(record: &VaultRecord) -> Result<Address, ChainError> {
    record
        .vault_address()
        .ok_or_else(|| ChainError::Client(format!("invalid vault address {}", record.address)))
}

/// Current cap, supply, and market time for a stored vault.
pub async fn observe_vault<R: ChainReader + ?Sized>(
    reader: &R,
    record: &VaultRecord,
) -> Result<Observation, ChainError> {
    let vault = parse_vault(record)?;
    let market = parse_market(record)?;
    let (cap, supply, latest_time) = futures::try_join!(
        reader.call_uint(vault, ViewCall::TotalSupplyCap),
        reader.call_uint(vault, ViewCall::TotalSupply),
        reader.call_uint(market, ViewCall::LatestTime),
    )?;
    Ok(Observation {
        cap,
        supply,
        latest_time,
    })
}

/// Build a fresh record for a newly seen vault. Returns the record and the
/// market's current time.
pub async fn fetch_vault<R: ChainReader + ?Sized>(
    reader: &R,
    vault: Address,
    block: u64,
    threshold: FillThreshold,
) -> Result<(VaultRecord, U256), ChainError> {
    let (name, symbol, cap, supply, maturity, market) = futures::try_join!(
        reader.call_text(vault, ViewCall::Name),
        reader.call_text(vault, ViewCall::Symbol),
        reader.call_uint(vault, ViewCall::TotalSupplyCap),
        reader.call_uint(vault, ViewCall::TotalSupply),
        reader.call_uint(vault, ViewCall::Maturity),
        reader.call_address(vault, ViewCall::Market),
    )?;
    let latest_time = reader.call_uint(market, ViewCall::LatestTime).await?;

    let capacity = Capacity::new(cap, supply, threshold);
    let record = VaultRecord {
        address: normalize_address(&vault),
        name,
        symbol,
        total_supply_cap: capacity.cap,
        last_known_total_supply: capacity.supply,
        maturity,
        market_address: normalize_address(&market),
        is_filled: capacity.is_filled,
        last_checked_block: block,
        created_at: chrono::Utc::now().timestamp(),
        deposit_token_symbol: None,
        deposit_token_decimals: None,
        account_id: None,
    };
    Ok((record, latest_time))
}

/// Resolve deposit-token metadata and the vault's account id.
///
/// Each piece is fetched independently; whatever resolves is returned.
/// Fails only when nothing resolved.
pub async fn resolve_metadata<R: ChainReader + ?Sized>(
    reader: &R,
    hub: Address,
    vault: Address,
) -> Result<VaultPatch, ChainError> {
    let mut patch = VaultPatch::default();
    let mut first_err = None;

    match reader.call_word(vault, ViewCall::Account).await {
        Ok(word) => patch.account_id = Some(format!("0x{}", alloy::hex::encode(word.as_slice()))),
        Err(e) => {
            debug!(vault = %vault, error = %e, "account id unavailable");
            first_err.get_or_insert(e);
        }
    }

    match resolve_token(reader, hub, vault).await {
        Ok((symbol, decimals)) => {
            patch.deposit_token_symbol = Some(symbol);
            patch.deposit_token_decimals = Some(decimals);
        }
        Err(e) => {
            debug!(vault = %vault, error = %e, "deposit token unavailable");
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) if patch.is_empty() => Err(e),
        _ => Ok(patch),
    }
}

async fn resolve_token<R: ChainReader + ?Sized>(
    reader: &R,
    hub: Address,
    vault: Address,
) -> Result<(String, u8), ChainError> {
    let raw_id = reader.call_uint(vault, ViewCall::TokenId).await?;
    let token_id = u16::try_from(raw_id)
        .map_err(|_| ChainError::Client(format!("token id {} out of range", raw_id)))?;
    let token = reader
        .call_address(hub, ViewCall::TokenAddress { token_id })
        .await?;
    let (symbol, decimals) = futures::try_join!(
        reader.call_text(token, ViewCall::Symbol),
        reader.call_uint(token, ViewCall::Decimals),
    )?;
    let decimals = u8::try_from(decimals)
        .map_err(|_| ChainError::Client(format!("decimals {} out of range", decimals)))?;
    Ok((symbol, decimals))
}
