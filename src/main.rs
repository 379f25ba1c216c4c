use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use vaultwatch::api::{self, ApiState};
use vaultwatch::chain::{abi, RpcChainReader};
use vaultwatch::config::Config;
use vaultwatch::notify::{
    FanoutSink, FileSink, LogSink, NotificationSink, Notifier, TelegramCommandListener,
    TelegramSink, VaultEvent,
};
use vaultwatch::query::{LiveVaultCache, LiveVaultService};
use vaultwatch::store::SnapshotStore;
use vaultwatch::tracker::{Contracts, TrackerPolicy, VaultTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::discover().context("failed to load config")?;
    vaultwatch::init_tracing(&config.logging);

    info!("vaultwatch v{} starting", env!("CARGO_PKG_VERSION"));

    let (factory, hub) = config.validate().context("invalid config")?;

    // --- Snapshot store (fatal if unusable) ---
    let store = Arc::new(
        SnapshotStore::open(&config.state.path)
            .await
            .with_context(|| format!("failed to open snapshot at {}", config.state.path))?,
    );

    // --- Chain ---
    for (name, ok) in abi::verify_topic_hashes() {
        if !ok {
            warn!(event = %name, "topic hash mismatch, logs for this event will not match");
        }
    }
    let reader = Arc::new(RpcChainReader::new(
        &config.chain.rpc_url,
        config.chain.log_chunk_size,
    )?);
    info!(factory = %factory, hub = %hub, "chain reader ready");

    // --- Notifications ---
    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if config.has_telegram() {
        sinks.push(Arc::new(TelegramSink::new(
            &config.notify.telegram_bot_token,
            &config.notify.telegram_chat_id,
        )?));
        info!("telegram notifications enabled");
    } else {
        warn!("no telegram credentials configured, notifications go to the log only");
    }
    if let Some(path) = &config.notify.file_path {
        sinks.push(Arc::new(FileSink::new(path)));
        info!(path = %path, "file notifications enabled");
    }
    if sinks.is_empty() {
        sinks.push(Arc::new(LogSink));
    }
    let (notifier, dispatcher) = Notifier::spawn(Arc::new(FanoutSink::new(sinks)));

    if config.notify.startup_message {
        let vaults = store.vaults().await.len();
        let last_block = store.last_processed_block().await;
        notifier.emit(VaultEvent::Startup { vaults, last_block });
    }

    // --- Query surfaces ---
    let policy = TrackerPolicy::from_config(&config);
    let cache = LiveVaultCache::new(config.query.cache_ttl());
    let service = Arc::new(LiveVaultService::new(
        reader.clone(),
        store.clone(),
        cache.clone(),
        hub,
        policy.threshold,
        policy.batch_size,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_handle = if config.query.bind.is_empty() {
        None
    } else {
        let state = ApiState {
            service: service.clone(),
            store: store.clone(),
        };
        let bind = config.query.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(state, &bind).await {
                error!(error = %e, "query api stopped");
            }
        }))
    };

    let listener_handle = if config.has_telegram() && config.notify.commands {
        let listener = TelegramCommandListener::new(
            &config.notify.telegram_bot_token,
            &config.notify.telegram_chat_id,
            service.clone(),
        )?;
        Some(tokio::spawn(listener.run(shutdown_rx.clone())))
    } else {
        None
    };

    // --- Tracker ---
    let tracker = VaultTracker::new(
        reader,
        store,
        notifier,
        cache,
        Contracts { factory, hub },
        policy,
    );
    let tracker_handle = tokio::spawn(tracker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing current iteration");
    let _ = shutdown_tx.send(true);

    if let Err(e) = tracker_handle.await {
        error!(error = %e, "tracker task failed");
    }
    if let Some(handle) = listener_handle {
        handle.abort();
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }
    // Tracker dropped its notifier; let queued notifications drain
    let _ = dispatcher.await;

    info!("vaultwatch stopped");
    Ok(())
}
