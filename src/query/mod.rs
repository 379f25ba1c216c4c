//! Live-vault query: which tracked vaults are still open for deposits.
//!
//! Results are cached for a short TTL. The tracker invalidates the cache on
//! every persisted capacity change; a generation counter stops a query that
//! was already in flight from re-caching stale results.

use crate::chain::{ChainError, ChainReader};
use crate::notify::format::{escape, fmt_amount, fmt_maturity};
use crate::store::SnapshotStore;
use crate::tracker::reads::{observe_vault, resolve_metadata};
use crate::vault::{utilization_pct, FillThreshold, VaultRecord, VaultStatus};
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One vault that is neither expired nor filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVault {
    pub address: String,
    pub name: String,
    pub symbol: String,
    #[serde(with = "crate::vault::dec_u256")]
    pub total_supply: U256,
    #[serde(with = "crate::vault::dec_u256")]
    pub total_supply_cap: U256,
    pub utilization_pct: f64,
    #[serde(with = "crate::vault::dec_u256")]
    pub maturity: U256,
    pub deposit_token_symbol: Option<String>,
    pub deposit_token_decimals: Option<u8>,
}

impl LiveVault {
    fn from_record(record: &VaultRecord, supply: U256, cap: U256) -> Self {
        Self {
            address: record.address.clone(),
            name: record.name.clone(),
            symbol: record.symbol.clone(),
            total_supply: supply,
            total_supply_cap: cap,
            utilization_pct: utilization_pct(supply, cap),
            maturity: record.maturity,
            deposit_token_symbol: record.deposit_token_symbol.clone(),
            deposit_token_decimals: record.deposit_token_decimals,
        }
    }

    fn render_line(&self) -> String {
        let token = self.deposit_token_symbol.as_deref().unwrap_or("");
        format!(
            "• <b>{}</b> ({}) {:.2}%\n  {} / {} {}\n  matures {}\n  <code>{}</code>",
            escape(&self.name),
            escape(&self.symbol),
            self.utilization_pct,
            fmt_amount(self.total_supply, self.deposit_token_decimals),
            fmt_amount(self.total_supply_cap, self.deposit_token_decimals),
            escape(token),
            fmt_maturity(self.maturity),
            self.address
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVaultReport {
    pub generated_at: DateTime<Utc>,
    /// Ascending by utilization.
    pub vaults: Vec<LiveVault>,
    /// Tracked vaults whose chain reads failed; they may or may not be live.
    pub unreadable: usize,
    #[serde(skip)]
    rendered: String,
}

impl LiveVaultReport {
    pub fn new(mut vaults: Vec<LiveVault>, unreadable: usize) -> Self {
        vaults.sort_by(|a, b| a.utilization_pct.total_cmp(&b.utilization_pct));
        let rendered = render_report(&vaults, unreadable);
        Self {
            generated_at: Utc::now(),
            vaults,
            unreadable,
            rendered,
        }
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Every tracked vault was read.
    pub fn is_complete(&self) -> bool {
        self.unreadable == 0
    }
}

fn render_report(vaults: &[LiveVault], unreadable: usize) -> String {
    if vaults.is_empty() {
        if unreadable > 0 {
            return format!(
                "Live vaults unavailable: could not read {unreadable} tracked vault(s). Try again shortly."
            );
        }
        return "No live vaults right now: every tracked vault is filled or expired.".to_string();
    }
    let mut out = format!("<b>Live vaults ({})</b>", vaults.len());
    for vault in vaults {
        out.push_str("\n\n");
        out.push_str(&vault.render_line());
    }
    if unreadable > 0 {
        out.push_str(&format!(
            "\n\n<i>{unreadable} vault(s) could not be read and are not listed.</i>"
        ));
    }
    out
}

struct CacheEntry {
    report: Arc<LiveVaultReport>,
    stored_at: Instant,
}

/// Short-lived cache of the last live-vault report.
#[derive(Clone)]
pub struct LiveVaultCache {
    ttl: Duration,
    entry: Arc<RwLock<Option<CacheEntry>>>,
    generation: Arc<AtomicU64>,
}

impl LiveVaultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> Option<Arc<LiveVaultReport>> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.report.clone())
    }

    /// Current invalidation generation; pass it back to `put`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store `report` unless the cache was invalidated since `generation`.
    pub async fn put(&self, report: Arc<LiveVaultReport>, generation: u64) -> bool {
        let mut entry = self.entry.write().await;
        if self.generation() != generation {
            debug!("live vault cache invalidated during query, not caching");
            return false;
        }
        *entry = Some(CacheEntry {
            report,
            stored_at: Instant::now(),
        });
        true
    }

    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.entry.write().await = None;
    }
}

/// Answers "which vaults are live right now" from fresh chain reads.
pub struct LiveVaultService<R: ChainReader> {
    reader: Arc<R>,
    store: Arc<SnapshotStore>,
    cache: LiveVaultCache,
    hub: Address,
    threshold: FillThreshold,
    batch_size: usize,
}

impl<R: ChainReader> LiveVaultService<R> {
    pub fn new(
        reader: Arc<R>,
        store: Arc<SnapshotStore>,
        cache: LiveVaultCache,
        hub: Address,
        threshold: FillThreshold,
        batch_size: usize,
    ) -> Self {
        Self {
            reader,
            store,
            cache,
            hub,
            threshold,
            batch_size: batch_size.max(1),
        }
    }

    pub fn cache(&self) -> &LiveVaultCache {
        &self.cache
    }

    /// Live vaults sorted by ascending utilization.
    ///
    /// Vaults whose reads fail are counted in `unreadable` rather than failing
    /// the whole query. Incomplete reports are never cached.
    pub async fn list_live_vaults(&self) -> Arc<LiveVaultReport> {
        if let Some(report) = self.cache.get().await {
            debug!(vaults = report.vaults.len(), "live vaults served from cache");
            return report;
        }

        let generation = self.cache.generation();
        let records = self.store.vaults().await;
        let mut live = Vec::new();
        let mut unreadable = 0;
        for batch in records.chunks(self.batch_size) {
            let results =
                futures::future::join_all(batch.iter().map(|r| self.inspect(r))).await;
            for (record, result) in batch.iter().zip(results) {
                match result {
                    Ok(Some(vault)) => live.push(vault),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(vault = %record.address, error = %e, "could not read vault for live query");
                        unreadable += 1;
                    }
                }
            }
        }

        let report = Arc::new(LiveVaultReport::new(live, unreadable));
        info!(
            tracked = records.len(),
            live = report.vaults.len(),
            unreadable,
            "live vault query complete"
        );
        if report.is_complete() {
            self.cache.put(report.clone(), generation).await;
        }
        report
    }

    async fn inspect(&self, record: &VaultRecord) -> Result<Option<LiveVault>, ChainError> {
        let obs = observe_vault(self.reader.as_ref(), record).await?;
        let status = VaultStatus::derive(
            obs.latest_time,
            record.maturity,
            obs.supply,
            obs.cap,
            self.threshold,
        );
        if !status.is_live() {
            debug!(vault = %record.address, %status, "not live");
            return Ok(None);
        }

        let mut record = record.clone();
        if record.needs_metadata() {
            self.backfill_metadata(&mut record).await;
        }
        Ok(Some(LiveVault::from_record(&record, obs.supply, obs.cap)))
    }

    async fn backfill_metadata(&self, record: &mut VaultRecord) {
        let Some(vault) = record.vault_address() else {
            return;
        };
        match resolve_metadata(self.reader.as_ref(), self.hub, vault).await {
            Ok(patch) => {
                record.apply(&patch);
                if let Err(e) = self.store.patch_vault(&record.address, &patch).await {
                    warn!(vault = %record.address, error = %e, "failed to persist vault metadata");
                }
            }
            Err(e) => debug!(vault = %record.address, error = %e, "metadata still unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{addr, MockChainReader};
    use crate::vault::normalize_address;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<MockChainReader>, Arc<SnapshotStore>) {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("state.json")).await.unwrap();
        (dir, Arc::new(MockChainReader::new(100)), Arc::new(store))
    }

    async fn track(
        reader: &MockChainReader,
        store: &SnapshotStore,
        vault: Address,
        cap: u64,
        supply: u64,
        maturity: u64,
    ) {
        let market = addr(0xaa);
        reader.add_vault(vault, market, cap, supply, maturity);
        let mut record =
            crate::vault::sample_record(&normalize_address(&vault), cap, supply, maturity);
        record.market_address = normalize_address(&market);
        store.upsert_vault(record).await.unwrap();
    }

    fn service(
        reader: Arc<MockChainReader>,
        store: Arc<SnapshotStore>,
        ttl: Duration,
    ) -> LiveVaultService<MockChainReader> {
        LiveVaultService::new(
            reader,
            store,
            LiveVaultCache::new(ttl),
            addr(0x99),
            FillThreshold::from_pct(98.0),
            5,
        )
    }

    #[tokio::test]
    async fn test_lists_live_vaults_sorted_by_utilization() {
        let (_dir, reader, store) = setup().await;
        reader.set_latest_time(addr(0xaa), 10);
        track(&reader, &store, addr(1), 1000, 900, 100).await;
        track(&reader, &store, addr(2), 1000, 100, 100).await;
        track(&reader, &store, addr(3), 1000, 500, 100).await;

        let svc = service(reader, store, Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        let order: Vec<_> = report.vaults.iter().map(|v| v.address.clone()).collect();
        assert_eq!(
            order,
            vec![
                normalize_address(&addr(2)),
                normalize_address(&addr(3)),
                normalize_address(&addr(1))
            ]
        );
        assert!(report.rendered().starts_with("<b>Live vaults (3)</b>"));
    }

    #[tokio::test]
    async fn test_excludes_filled_and_expired() {
        let (_dir, reader, store) = setup().await;
        reader.set_latest_time(addr(0xaa), 50);
        track(&reader, &store, addr(1), 1000, 990, 100).await; // filled
        track(&reader, &store, addr(2), 1000, 100, 50).await; // expired at equality
        track(&reader, &store, addr(3), 1000, 100, 100).await;

        let svc = service(reader, store, Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        assert_eq!(report.vaults.len(), 1);
        assert_eq!(report.vaults[0].address, normalize_address(&addr(3)));
    }

    #[tokio::test]
    async fn test_uses_fresh_chain_values_not_stored() {
        let (_dir, reader, store) = setup().await;
        track(&reader, &store, addr(1), 1000, 100, 100).await;
        // Filled on-chain since the record was written
        reader.set_supply(addr(1), 1000);

        let svc = service(reader, store, Duration::from_secs(30));
        assert!(svc.list_live_vaults().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_result_has_explicit_message() {
        let (_dir, reader, store) = setup().await;
        let svc = service(reader, store, Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        assert!(report.is_empty());
        assert!(report.rendered().contains("No live vaults"));
    }

    #[tokio::test]
    async fn test_failed_vault_is_counted_not_listed() {
        let (_dir, reader, store) = setup().await;
        track(&reader, &store, addr(1), 1000, 100, 100).await;
        track(&reader, &store, addr(2), 1000, 200, 100).await;
        reader.fail_calls(addr(1), true);

        let svc = service(reader, store, Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        assert_eq!(report.vaults.len(), 1);
        assert_eq!(report.vaults[0].address, normalize_address(&addr(2)));
        assert_eq!(report.unreadable, 1);
        assert!(report.rendered().contains("1 vault(s) could not be read"));
    }

    #[tokio::test]
    async fn test_unreadable_vaults_are_not_reported_as_none_live() {
        let (_dir, reader, store) = setup().await;
        track(&reader, &store, addr(1), 1000, 100, 100).await;
        reader.fail_calls(addr(1), true);

        let svc = service(reader.clone(), store, Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        assert!(report.is_empty());
        assert!(!report.is_complete());
        assert!(!report.rendered().contains("No live vaults"));
        assert!(report.rendered().contains("could not read 1 tracked vault(s)"));
        // An incomplete answer is not cached
        assert!(svc.cache().get().await.is_none());

        reader.fail_calls(addr(1), false);
        let report = svc.list_live_vaults().await;
        assert!(report.is_complete());
        assert_eq!(report.vaults.len(), 1);
        assert!(svc.cache().get().await.is_some());
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl_and_invalidates() {
        let (_dir, reader, store) = setup().await;
        track(&reader, &store, addr(1), 1000, 100, 100).await;
        let svc = service(reader.clone(), store, Duration::from_secs(30));

        let first = svc.list_live_vaults().await;
        let calls = reader.call_count();
        let second = svc.list_live_vaults().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reader.call_count(), calls);

        svc.cache().invalidate().await;
        reader.set_supply(addr(1), 1000);
        assert!(svc.list_live_vaults().await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let cache = LiveVaultCache::new(Duration::from_millis(20));
        let report = Arc::new(LiveVaultReport::new(Vec::new(), 0));
        assert!(cache.put(report, cache.generation()).await);
        assert!(cache.get().await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_not_cached() {
        let cache = LiveVaultCache::new(Duration::from_secs(30));
        let generation = cache.generation();
        cache.invalidate().await;
        assert!(!cache.put(Arc::new(LiveVaultReport::new(Vec::new(), 0)), generation).await);
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn test_metadata_backfilled_on_query() {
        let (_dir, reader, store) = setup().await;
        track(&reader, &store, addr(1), 1000, 100, 100).await;
        reader.register_token(1, addr(0x77), "USDC", 6);

        let svc = service(reader, store.clone(), Duration::from_secs(30));
        let report = svc.list_live_vaults().await;
        assert_eq!(report.vaults[0].deposit_token_symbol.as_deref(), Some("USDC"));

        let stored = store.get_vault(&normalize_address(&addr(1))).await.unwrap();
        assert_eq!(stored.deposit_token_decimals, Some(6));
        assert!(stored.account_id.is_some());
    }
}
