//! Vault lifecycle tracker: the polling loop.
//!
//! ```text
//!   startup:  height ─► [no committed height?] backfill (silent) ─► commit head
//!                     └─► baseline sweep (notifying)
//!
//!   each tick (from = last_processed + 1, to = head):
//!     1. VaultCreated logs on the factory   ─► fetch, persist, notify
//!     2. cap-change logs on each vault      ─► re-read supply, persist, notify
//!     3. every N blocks: full sweep          ─► cap/supply/fill transitions
//!     4. commit `to` unless a transient failure left events unhandled
//! ```
//!
//! Chain reads are "latest" reads. A record's `last_checked_block` is the
//! height its state is known to reflect, and cap events at or below it are
//! already accounted for. That keeps replays of an uncommitted range quiet.

pub mod inspect;
pub mod reads;


use crate::chain::{ChainError, ChainReader, EventArgs, EventKind};
use crate::config::Config;
use crate::notify::{Notifier, VaultEvent};
use crate::query::LiveVaultCache;
use crate::store::{PersistenceError, SnapshotStore};
use crate::vault::{is_expired, normalize_address, FillThreshold, VaultPatch, VaultRecord};
use alloy::primitives::{Address, U256};
use inspect::{evaluate, Observation, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const STARTUP_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const STARTUP_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Contract addresses the tracker watches.
#[derive(Debug, Clone, Copy)]
pub struct Contracts {
    pub factory: Address,
    pub hub: Address,
}

#[derive(Debug, Clone)]
pub struct TrackerPolicy {
    pub poll_interval: Duration,
    pub sweep_interval_blocks: u64,
    pub backfill_window_blocks: u64,
    /// Overrides the backfill window on a cold start.
    pub start_block: Option<u64>,
    pub threshold: FillThreshold,
    pub batch_size: usize,
}

impl TrackerPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.monitor.poll_interval(),
            sweep_interval_blocks: config.monitor.sweep_interval_blocks,
            backfill_window_blocks: config.monitor.backfill_window_blocks,
            start_block: config.chain.start_block,
            threshold: FillThreshold::from_pct(config.monitor.fill_threshold_pct),
            batch_size: config.monitor.batch_size.max(1),
        }
    }
}

/// What one step of a tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub handled: usize,
    pub errors: usize,
    /// A transient failure left events unhandled; the range must be re-scanned.
    pub rescan: bool,
}

impl StepReport {
    fn fail(&mut self, err: &ChainError) {
        self.errors += 1;
        self.rescan |= err.is_transient();
    }
}

/// Summary of one polling tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub from_block: u64,
    pub to_block: u64,
    pub created: StepReport,
    pub cap_updates: StepReport,
    pub sweep: Option<StepReport>,
    /// Height persisted at the end of the tick, if it advanced.
    pub committed: Option<u64>,
}

pub struct VaultTracker<R: ChainReader> {
    reader: Arc<R>,
    store: Arc<SnapshotStore>,
    notifier: Notifier,
    cache: LiveVaultCache,
    contracts: Contracts,
    policy: TrackerPolicy,
    last_sweep_block: u64,
}

impl<R: ChainReader> VaultTracker<R> {
    pub fn new(
        reader: Arc<R>,
        store: Arc<SnapshotStore>,
        notifier: Notifier,
        cache: LiveVaultCache,
        contracts: Contracts,
        policy: TrackerPolicy,
    ) -> Self {
        Self {
            reader,
            store,
            notifier,
            cache,
            contracts,
            policy,
            last_sweep_block: 0,
        }
    }

    /// Backfill on a cold start, then run a notifying baseline sweep.
    ///
    /// The start stays cold until a backfill commits its head, so vaults left
    /// behind by an interrupted backfill are finished silently on retry.
    pub async fn startup(&mut self) -> Result<u64, TrackerError> {
        let head = self.reader.current_height().await?;
        let last_block = self.store.last_processed_block().await;
        if last_block == 0 {
            self.backfill(head).await?;
        } else {
            let vaults = self.store.vaults().await.len();
            info!(vaults, last_block, "resuming from snapshot");
        }

        let report = self.sweep(head).await;
        self.last_sweep_block = head;
        info!(
            head,
            inspected = report.handled,
            errors = report.errors,
            "baseline sweep complete"
        );
        Ok(head)
    }

    /// Populate the store from historical creation events without notifying,
    /// then commit `head`. Vaults already stored are left alone.
    pub async fn backfill(&self, head: u64) -> Result<usize, TrackerError> {
        let from = self
            .policy
            .start_block
            .unwrap_or_else(|| head.saturating_sub(self.policy.backfill_window_blocks));
        info!(from, to = head, "cold start, backfilling vault creations");

        let events = self
            .reader
            .get_events(self.contracts.factory, EventKind::VaultCreated, from, head)
            .await?;
        let mut added = 0;
        for event in events {
            let EventArgs::VaultCreated { vault, .. } = event.args else {
                continue;
            };
            if self.store.contains(&normalize_address(&vault)).await {
                continue;
            }
            match self.observe_new_vault(vault, head, false).await {
                Ok(_) => added += 1,
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => warn!(vault = %vault, error = %e, "skipping vault during backfill"),
            }
        }
        self.store.commit_block(head).await?;
        info!(added, head, "backfill complete");
        Ok(added)
    }

    /// One polling tick over `(last_processed, head]`.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, ChainError> {
        let from = self.store.last_processed_block().await + 1;
        let to = self.reader.current_height().await?;
        let mut outcome = PollOutcome {
            from_block: from,
            to_block: to,
            ..PollOutcome::default()
        };
        if from > to {
            debug!(from, to, "no new blocks");
            return Ok(outcome);
        }

        outcome.created = self.detect_new_vaults(from, to).await;
        outcome.cap_updates = self.detect_cap_updates(from, to).await;

        if to >= self.last_sweep_block + self.policy.sweep_interval_blocks {
            outcome.sweep = Some(self.sweep(to).await);
            self.last_sweep_block = to;
        }

        if outcome.created.rescan || outcome.cap_updates.rescan {
            warn!(from, to, "transient failure, range will be rescanned");
        } else {
            match self.store.commit_block(to).await {
                Ok(height) => outcome.committed = Some(height),
                Err(e) => error!(block = to, error = %e, "failed to persist processed block"),
            }
        }

        info!(
            from,
            to,
            created = outcome.created.handled,
            cap_updates = outcome.cap_updates.handled,
            swept = ?outcome.sweep.map(|s| s.handled),
            committed = ?outcome.committed,
            "poll complete"
        );
        Ok(outcome)
    }

    async fn detect_new_vaults(&self, from: u64, to: u64) -> StepReport {
        let mut report = StepReport::default();
        let events = match self
            .reader
            .get_events(self.contracts.factory, EventKind::VaultCreated, from, to)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(from, to, error = %e, "failed to fetch vault creation logs");
                report.fail(&e);
                return report;
            }
        };

        for event in events {
            let EventArgs::VaultCreated { vault, .. } = event.args else {
                continue;
            };
            if self.store.contains(&normalize_address(&vault)).await {
                debug!(vault = %vault, "vault already tracked");
                continue;
            }
            match self.observe_new_vault(vault, to, true).await {
                Ok(_) => report.handled += 1,
                Err(e) => {
                    warn!(vault = %vault, block = event.block_number, error = %e, "failed to load new vault");
                    report.fail(&e);
                }
            }
        }
        report
    }

    /// Fetch, enrich, persist, and optionally announce a vault not yet tracked.
    async fn observe_new_vault(
        &self,
        vault: Address,
        block: u64,
        notify: bool,
    ) -> Result<VaultRecord, ChainError> {
        let (mut record, latest_time) =
            reads::fetch_vault(self.reader.as_ref(), vault, block, self.policy.threshold).await?;
        match reads::resolve_metadata(self.reader.as_ref(), self.contracts.hub, vault).await {
            Ok(patch) => record.apply(&patch),
            Err(e) => debug!(vault = %vault, error = %e, "metadata not yet available"),
        }

        if let Err(e) = self.store.upsert_vault(record.clone()).await {
            error!(vault = %record.address, error = %e, "failed to persist new vault");
        }
        self.cache.invalidate().await;

        let expired = is_expired(latest_time, record.maturity);
        info!(
            vault = %record.address,
            name = %record.name,
            cap = %record.total_supply_cap,
            supply = %record.last_known_total_supply,
            filled = record.is_filled,
            expired,
            "tracking vault"
        );
        if notify && !expired {
            self.notifier.emit(VaultEvent::VaultCreated {
                record: record.clone(),
                filled: record.is_filled,
            });
        }
        Ok(record)
    }

    async fn detect_cap_updates(&self, from: u64, to: u64) -> StepReport {
        let mut report = StepReport::default();
        for record in self.store.vaults().await {
            let Some(vault) = record.vault_address() else {
                continue;
            };
            let events = match self
                .reader
                .get_events(vault, EventKind::SupplyCapUpdated, from, to)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(vault = %record.address, error = %e, "failed to fetch cap logs");
                    report.fail(&e);
                    continue;
                }
            };

            // Only events newer than the state the record already reflects
            let pending: Vec<_> = events
                .into_iter()
                .filter(|e| e.block_number > record.last_checked_block)
                .collect();
            for event in pending {
                let EventArgs::SupplyCapUpdated { new_cap } = event.args else {
                    continue;
                };
                match self
                    .apply_cap_update(&record.address, new_cap, event.block_number)
                    .await
                {
                    Ok(true) => report.handled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(vault = %record.address, error = %e, "failed to apply cap update");
                        report.fail(&e);
                    }
                }
            }
        }
        report
    }

    /// Refresh a vault after a cap-changed log. A replayed event whose cap
    /// matches the stored one refreshes supply but raises nothing.
    async fn apply_cap_update(
        &self,
        key: &str,
        new_cap: U256,
        block: u64,
    ) -> Result<bool, ChainError> {
        let Some(prev) = self.store.get_vault(key).await else {
            return Ok(false);
        };
        let mut obs = reads::observe_vault(self.reader.as_ref(), &prev).await?;
        // The logged value is authoritative for this event's transition
        obs.cap = new_cap;
        self.settle(&prev, obs, block).await;
        Ok(new_cap != prev.total_supply_cap)
    }

    /// Re-read every tracked vault and emit transitions against stored state.
    async fn sweep(&self, block: u64) -> StepReport {
        let mut report = StepReport::default();
        let records = self.store.vaults().await;
        debug!(vaults = records.len(), block, "sweeping vaults");

        for batch in records.chunks(self.policy.batch_size) {
            let observed = futures::future::join_all(
                batch
                    .iter()
                    .map(|r| reads::observe_vault(self.reader.as_ref(), r)),
            )
            .await;

            // Merge sequentially so store writes and notifications stay ordered
            for (record, result) in batch.iter().zip(observed) {
                match result {
                    Ok(obs) => {
                        let prev = self
                            .store
                            .get_vault(&record.address)
                            .await
                            .unwrap_or_else(|| record.clone());
                        report.handled += 1;
                        if is_expired(obs.latest_time, prev.maturity) {
                            continue;
                        }
                        self.settle(&prev, obs, block).await;
                        if prev.needs_metadata() {
                            self.enrich_metadata(&prev).await;
                        }
                    }
                    Err(e) => {
                        warn!(vault = %record.address, error = %e, "sweep read failed");
                        report.errors += 1;
                    }
                }
            }
        }
        report
    }

    /// Persist a new observation for `prev` and emit its transitions.
    async fn settle(&self, prev: &VaultRecord, obs: Observation, block: u64) {
        let inspection = evaluate(prev, obs, self.policy.threshold);
        if inspection.expired {
            debug!(vault = %prev.address, "vault expired, no notifications");
        }

        let mut record = prev.clone();
        if inspection.capacity_changed(prev) {
            let patch = VaultPatch::capacity(inspection.capacity, block);
            self.persist(prev, patch.clone()).await;
            self.cache.invalidate().await;
            record.apply(&patch);
        } else {
            // Written with the tick's commit instead of one file write per vault
            self.store.mark_checked(&prev.address, block).await;
            record.last_checked_block = record.last_checked_block.max(block);
        }

        for transition in inspection.transitions {
            let event = match transition {
                Transition::CapRaised { old_cap, new_cap } => VaultEvent::CapRaised {
                    record: record.clone(),
                    old_cap,
                    new_cap,
                    current_supply: inspection.capacity.supply,
                },
                Transition::Filled => VaultEvent::VaultFilled {
                    record: record.clone(),
                },
                Transition::Available => VaultEvent::VaultAvailable {
                    record: record.clone(),
                },
            };
            info!(vault = %record.address, kind = event.kind(), "vault transition");
            self.notifier.emit(event);
        }
    }

    async fn persist(&self, prev: &VaultRecord, patch: VaultPatch) {
        if let Err(e) = self.store.patch_vault(&prev.address, &patch).await {
            error!(vault = %prev.address, error = %e, "failed to persist vault update");
        }
    }

    async fn enrich_metadata(&self, record: &VaultRecord) {
        let Some(vault) = record.vault_address() else {
            return;
        };
        match reads::resolve_metadata(self.reader.as_ref(), self.contracts.hub, vault).await {
            Ok(patch) => self.persist(record, patch).await,
            Err(e) => debug!(vault = %record.address, error = %e, "metadata still unavailable"),
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = STARTUP_BACKOFF_INITIAL;
        loop {
            match self.startup().await {
                Ok(head) => {
                    info!(head, "tracker started");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "tracker startup failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(STARTUP_BACKOFF_MAX);
                }
            }
        }

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "poll failed, retrying next tick");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("tracker stopped");
    }
}
