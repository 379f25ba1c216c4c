//! One-shot live-vault query against the current snapshot.
//!
//! Usage:
//!   cargo run --bin live_vaults            # human-readable table
//!   cargo run --bin live_vaults -- --json  # JSON report

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use vaultwatch::chain::RpcChainReader;
use vaultwatch::config::Config;
use vaultwatch::notify::format::fmt_amount;
use vaultwatch::query::{LiveVaultCache, LiveVaultService};
use vaultwatch::store::SnapshotStore;
use vaultwatch::vault::FillThreshold;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let json = std::env::args().any(|a| a == "--json");

    let config = Config::discover().context("failed to load config")?;
    vaultwatch::init_tracing(&config.logging);
    let (_, hub) = config.validate()?;

    if !Path::new(&config.state.path).exists() {
        bail!(
            "no snapshot at {}; run vaultwatch first to discover vaults",
            config.state.path
        );
    }
    let store = Arc::new(SnapshotStore::open(&config.state.path).await?);
    let reader = Arc::new(RpcChainReader::new(
        &config.chain.rpc_url,
        config.chain.log_chunk_size,
    )?);

    let service = LiveVaultService::new(
        reader,
        store,
        LiveVaultCache::new(config.query.cache_ttl()),
        hub,
        FillThreshold::from_pct(config.monitor.fill_threshold_pct),
        config.monitor.batch_size,
    );
    let report = service.list_live_vaults().await;

    if json {
        println!("{}", serde_json::to_string_pretty(report.as_ref())?);
        return Ok(());
    }

    if report.is_empty() {
        if !report.is_complete() {
            bail!(
                "could not read {} tracked vault(s); live vaults unknown",
                report.unreadable
            );
        }
        println!("No live vaults.");
        return Ok(());
    }

    println!(
        "{:<44} {:<24} {:>8} {:>20} {:>20}",
        "ADDRESS", "NAME", "UTIL %", "SUPPLY", "CAP"
    );
    for v in &report.vaults {
        let token = v.deposit_token_symbol.as_deref().unwrap_or("");
        println!(
            "{:<44} {:<24} {:>7.2}% {:>20} {:>20} {}",
            v.address,
            v.name,
            v.utilization_pct,
            fmt_amount(v.total_supply, v.deposit_token_decimals),
            fmt_amount(v.total_supply_cap, v.deposit_token_decimals),
            token
        );
    }
    println!("\n{} live vault(s) as of {}", report.vaults.len(), report.generated_at);
    if !report.is_complete() {
        eprintln!("warning: {} vault(s) could not be read and are not listed", report.unreadable);
    }
    Ok(())
}
