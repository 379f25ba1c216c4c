//! In-memory `ChainReader` for tests, with failure injection.

use crate::chain::{CallValue, ChainError, ChainEvent, ChainReader, EventArgs, EventKind, ViewCall};
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MockVault {
    pub name: String,
    pub symbol: String,
    pub supply: U256,
    pub cap: U256,
    pub maturity: U256,
    pub market: Address,
    pub token_id: u16,
    pub account: B256,
}

#[derive(Default)]
struct Inner {
    height: u64,
    events: Vec<(Address, EventKind, ChainEvent)>,
    vaults: HashMap<Address, MockVault>,
    latest_time: HashMap<Address, U256>,
    hub_tokens: HashMap<u16, Address>,
    tokens: HashMap<Address, (String, u8)>,
    failing_calls: HashSet<Address>,
    failing_logs: HashSet<Address>,
    fail_height: bool,
}

#[derive(Default)]
pub struct MockChainReader {
    inner: Mutex<Inner>,
    calls: AtomicUsize,
}

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

impl MockChainReader {
    pub fn new(height: u64) -> Self {
        let reader = Self::default();
        reader.set_height(height);
        reader
    }

    pub fn set_height(&self, height: u64) {
        self.inner.lock().unwrap().height = height;
    }

    pub fn set_latest_time(&self, market: Address, time: u64) {
        self.inner
            .lock()
            .unwrap()
            .latest_time
            .insert(market, U256::from(time));
    }

    /// Register a vault's contract state without emitting any event.
    pub fn add_vault(&self, vault: Address, market: Address, cap: u64, supply: u64, maturity: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.vaults.insert(
            vault,
            MockVault {
                name: format!("Vault {}", vault),
                symbol: "VLT".to_string(),
                supply: U256::from(supply),
                cap: U256::from(cap),
                maturity: U256::from(maturity),
                market,
                token_id: 1,
                account: B256::repeat_byte(0x42),
            },
        );
        inner.latest_time.entry(market).or_insert(U256::ZERO);
    }

    /// Deploy a vault and emit the factory creation event at `block`.
    pub fn create_vault(
        &self,
        factory: Address,
        vault: Address,
        market: Address,
        cap: u64,
        supply: u64,
        maturity: u64,
        block: u64,
    ) {
        self.add_vault(vault, market, cap, supply, maturity);
        self.push_event(
            factory,
            EventKind::VaultCreated,
            block,
            EventArgs::VaultCreated { vault, market },
        );
    }

    pub fn push_event(&self, contract: Address, kind: EventKind, block: u64, args: EventArgs) {
        self.inner.lock().unwrap().events.push((
            contract,
            kind,
            ChainEvent {
                block_number: block,
                transaction_hash: Some(B256::with_last_byte(block as u8)),
                args,
            },
        ));
    }

    /// Change the cap on-chain and emit the cap-changed event at `block`.
    pub fn raise_cap(&self, vault: Address, new_cap: u64, block: u64) {
        self.set_cap(vault, new_cap);
        self.push_event(
            vault,
            EventKind::SupplyCapUpdated,
            block,
            EventArgs::SupplyCapUpdated {
                new_cap: U256::from(new_cap),
            },
        );
    }

    /// Change the cap without an event (only a sweep can see it).
    pub fn set_cap(&self, vault: Address, cap: u64) {
        if let Some(v) = self.inner.lock().unwrap().vaults.get_mut(&vault) {
            v.cap = U256::from(cap);
        }
    }

    pub fn set_supply(&self, vault: Address, supply: u64) {
        if let Some(v) = self.inner.lock().unwrap().vaults.get_mut(&vault) {
            v.supply = U256::from(supply);
        }
    }

    pub fn register_token(&self, hub_token_id: u16, token: Address, symbol: &str, decimals: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.hub_tokens.insert(hub_token_id, token);
        inner.tokens.insert(token, (symbol.to_string(), decimals));
    }

    pub fn fail_calls(&self, contract: Address, fail: bool) {
        let mut inner = self.inner.lock().unwrap();
        if fail {
            inner.failing_calls.insert(contract);
        } else {
            inner.failing_calls.remove(&contract);
        }
    }

    pub fn fail_logs(&self, contract: Address, fail: bool) {
        let mut inner = self.inner.lock().unwrap();
        if fail {
            inner.failing_logs.insert(contract);
        } else {
            inner.failing_logs.remove(&contract);
        }
    }

    pub fn fail_height(&self, fail: bool) {
        self.inner.lock().unwrap().fail_height = fail;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn current_height(&self) -> Result<u64, ChainError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_height {
            return Err(ChainError::Transient("height unavailable".to_string()));
        }
        Ok(inner.height)
    }

    async fn get_events(
        &self,
        contract: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_logs.contains(&contract) {
            return Err(ChainError::Transient(format!("logs unavailable for {}", contract)));
        }
        let mut events: Vec<ChainEvent> = inner
            .events
            .iter()
            .filter(|(c, k, e)| {
                *c == contract && *k == kind && e.block_number >= from_block && e.block_number <= to_block
            })
            .map(|(_, _, e)| e.clone())
            .collect();
        events.sort_by_key(|e| e.block_number);
        Ok(events)
    }

    async fn call(&self, contract: Address, call: ViewCall) -> Result<CallValue, ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        if inner.failing_calls.contains(&contract) {
            return Err(ChainError::Transient(format!("call failed for {}", contract)));
        }

        if let ViewCall::LatestTime = call {
            return inner
                .latest_time
                .get(&contract)
                .map(|t| CallValue::Uint(*t))
                .ok_or_else(|| ChainError::Client(format!("no market at {}", contract)));
        }
        if let ViewCall::TokenAddress { token_id } = call {
            return inner
                .hub_tokens
                .get(&token_id)
                .map(|a| CallValue::Address(*a))
                .ok_or_else(|| ChainError::Client(format!("unknown token id {}", token_id)));
        }
        if let Some((symbol, decimals)) = inner.tokens.get(&contract) {
            return match call {
                ViewCall::Symbol => Ok(CallValue::Text(symbol.clone())),
                ViewCall::Decimals => Ok(CallValue::Uint(U256::from(*decimals))),
                other => Err(ChainError::Client(format!("token has no {}", other))),
            };
        }

        let vault = inner
            .vaults
            .get(&contract)
            .ok_or_else(|| ChainError::Client(format!("no contract at {}", contract)))?;
        let value = match call {
            ViewCall::Name => CallValue::Text(vault.name.clone()),
            ViewCall::Symbol => CallValue::Text(vault.symbol.clone()),
            ViewCall::TotalSupply => CallValue::Uint(vault.supply),
            ViewCall::TotalSupplyCap => CallValue::Uint(vault.cap),
            ViewCall::Maturity => CallValue::Uint(vault.maturity),
            ViewCall::Market => CallValue::Address(vault.market),
            ViewCall::TokenId => CallValue::Uint(U256::from(vault.token_id)),
            ViewCall::Account => CallValue::Word(vault.account),
            other => return Err(ChainError::Client(format!("vault has no {}", other))),
        };
        Ok(value)
    }
}
