//! File-backed snapshot store for vault records and the processed height.
//!
//! File format (JSON):
//!   {
//!     "lastProcessedBlock": 123,
//!     "vaults": { "0xabc…": { "totalSupplyCap": "1000", … } }
//!   }
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over the snapshot,
//! so an interrupted save leaves the previous snapshot intact. The processed
//! height is only ever written together with the full vault map, so it can
//! never be persisted ahead of the records that justify it.

use crate::vault::{MonitorState, VaultPatch, VaultRecord};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt snapshot at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

pub struct SnapshotStore {
    path: PathBuf,
    state: RwLock<MonitorState>,
    /// Serializes file writes so snapshots land in order.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open (or initialise) the snapshot at `path`. Fails if the parent
    /// directory cannot be created or an existing file cannot be parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let state: MonitorState =
                    serde_json::from_str(&contents).map_err(|e| PersistenceError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                info!(
                    path = %path.display(),
                    vaults = state.vaults.len(),
                    last_block = state.last_processed_block,
                    "loaded snapshot"
                );
                normalize_keys(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no snapshot found, starting empty");
                MonitorState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// The current snapshot.
    pub async fn load(&self) -> MonitorState {
        self.state.read().await.clone()
    }

    /// Replace the snapshot wholesale. The processed height never regresses.
    pub async fn save(&self, state: MonitorState) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut next = normalize_keys(state);
        {
            let current = self.state.read().await;
            next.last_processed_block = next.last_processed_block.max(current.last_processed_block);
        }
        write_atomic(&self.path, &next).await?;
        *self.state.write().await = next;
        Ok(())
    }

    pub async fn get_vault(&self, address: &str) -> Option<VaultRecord> {
        self.state
            .read()
            .await
            .vaults
            .get(&address.to_lowercase())
            .cloned()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.state
            .read()
            .await
            .vaults
            .contains_key(&address.to_lowercase())
    }

    pub async fn vaults(&self) -> Vec<VaultRecord> {
        self.state.read().await.vaults.values().cloned().collect()
    }

    pub async fn last_processed_block(&self) -> u64 {
        self.state.read().await.last_processed_block
    }

    /// Insert or replace a vault record and persist.
    ///
    /// The in-memory change is kept even if the write fails; the next
    /// successful write carries it.
    pub async fn upsert_vault(&self, mut record: VaultRecord) -> Result<(), PersistenceError> {
        record.address = record.address.to_lowercase();
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.state.write().await;
            state.vaults.insert(record.address.clone(), record);
            state.clone()
        };
        write_atomic(&self.path, &snapshot).await
    }

    /// Merge a partial update into an existing record and persist.
    /// Absent addresses are a no-op and return `Ok(false)`.
    pub async fn patch_vault(
        &self,
        address: &str,
        patch: &VaultPatch,
    ) -> Result<bool, PersistenceError> {
        let key = address.to_lowercase();
        let _guard = self.write_lock.lock().await;
        let snapshot = {
            let mut state = self.state.write().await;
            match state.vaults.get_mut(&key) {
                Some(record) => record.apply(patch),
                None => {
                    debug!(vault = %key, "patch for unknown vault ignored");
                    return Ok(false);
                }
            }
            state.clone()
        };
        write_atomic(&self.path, &snapshot).await?;
        Ok(true)
    }

    /// Record that a vault's stored state still holds at `block`, without
    /// writing. The bump is carried by the next write, normally the tick's
    /// `commit_block`. Returns `false` for unknown vaults.
    pub async fn mark_checked(&self, address: &str, block: u64) -> bool {
        let mut state = self.state.write().await;
        match state.vaults.get_mut(&address.to_lowercase()) {
            Some(record) => {
                record.last_checked_block = record.last_checked_block.max(block);
                true
            }
            None => false,
        }
    }

    /// Advance the processed height and persist it with the current records.
    ///
    /// On write failure the in-memory height is left untouched.
    pub async fn commit_block(&self, block: u64) -> Result<u64, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.state.read().await.clone();
        if block < snapshot.last_processed_block {
            warn!(
                requested = block,
                current = snapshot.last_processed_block,
                "refusing to regress processed block"
            );
        }
        let next = snapshot.last_processed_block.max(block);
        snapshot.last_processed_block = next;
        write_atomic(&self.path, &snapshot).await?;
        let mut state = self.state.write().await;
        state.last_processed_block = state.last_processed_block.max(next);
        Ok(state.last_processed_block)
    }
}

fn normalize_keys(mut state: MonitorState) -> MonitorState {
    let vaults = std::mem::take(&mut state.vaults);
    state.vaults = vaults
        .into_iter()
        .map(|(k, mut v)| {
            v.address = v.address.to_lowercase();
            (k.to_lowercase(), v)
        })
        .collect();
    state
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, state: &MonitorState) -> Result<(), PersistenceError> {
    let contents = serde_json::to_vec_pretty(state)?;
    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    debug!(
        path = %path.display(),
        vaults = state.vaults.len(),
        last_block = state.last_processed_block,
        "snapshot written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{sample_record, Capacity, FillThreshold};
    use alloy::primitives::U256;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_preserves_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = SnapshotStore::open(&path).await.unwrap();

        let mut big = sample_record("0xAAAA000000000000000000000000000000000001", 0, 0, 0);
        big.total_supply_cap = U256::MAX;
        big.last_known_total_supply = U256::from(u128::MAX) * U256::from(3u8);
        big.maturity = U256::from(1_900_000_000u64);
        big.deposit_token_symbol = Some("USDC".to_string());
        big.deposit_token_decimals = Some(6);
        big.account_id = Some("0x42".to_string());
        let plain = sample_record("0xbbbb000000000000000000000000000000000002", 1000, 980, 5);

        let mut state = MonitorState {
            last_processed_block: 987_654_321,
            ..MonitorState::default()
        };
        state.vaults.insert(big.address.clone(), big.clone());
        state.vaults.insert(plain.address.clone(), plain.clone());
        store.save(state.clone()).await.unwrap();

        let reopened = SnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.load().await, state);
        let back = reopened.get_vault(&big.address).await.unwrap();
        assert_eq!(back.total_supply_cap, U256::MAX);
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_patch_absent_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("s.json")).await.unwrap();
        let patch = VaultPatch {
            deposit_token_symbol: Some("USDC".to_string()),
            ..VaultPatch::default()
        };
        let applied = store.patch_vault("0xdead", &patch).await.unwrap();
        assert!(!applied);
        assert!(store.get_vault("0xdead").await.is_none());
        assert!(store.vaults().await.is_empty());
    }

    #[tokio::test]
    async fn test_patch_updates_capacity_and_keys_are_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("s.json")).await.unwrap();
        let record = sample_record("0xABCD", 1000, 100, 50);
        store.upsert_vault(record).await.unwrap();
        assert!(store.contains("0xabcd").await);

        let capacity = Capacity::new(U256::from(1000), U256::from(990), FillThreshold::from_pct(98.0));
        let applied = store
            .patch_vault("0xAbCd", &VaultPatch::capacity(capacity, 77))
            .await
            .unwrap();
        assert!(applied);
        let got = store.get_vault("0xabcd").await.unwrap();
        assert!(got.is_filled);
        assert_eq!(got.last_checked_block, 77);
    }

    #[tokio::test]
    async fn test_processed_block_never_regresses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        let store = SnapshotStore::open(&path).await.unwrap();

        assert_eq!(store.commit_block(100).await.unwrap(), 100);
        assert_eq!(store.commit_block(90).await.unwrap(), 100);

        let mut stale = store.load().await;
        stale.last_processed_block = 5;
        store.save(stale).await.unwrap();
        assert_eq!(store.last_processed_block().await, 100);

        let reopened = SnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.last_processed_block().await, 100);
    }

    #[tokio::test]
    async fn test_mark_checked_lands_with_next_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        let store = SnapshotStore::open(&path).await.unwrap();
        store
            .upsert_vault(sample_record("0xabcd", 1000, 100, 50))
            .await
            .unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();

        assert!(store.mark_checked("0xABCD", 40).await);
        assert!(!store.mark_checked("0xdead", 40).await);
        assert_eq!(store.get_vault("0xabcd").await.unwrap().last_checked_block, 40);
        // Memory only until the next write
        assert_eq!(std::fs::read_to_string(&path).unwrap(), on_disk);

        // Never moves backwards
        store.mark_checked("0xabcd", 30).await;
        assert_eq!(store.get_vault("0xabcd").await.unwrap().last_checked_block, 40);

        store.commit_block(40).await.unwrap();
        let reopened = SnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_vault("0xabcd").await.unwrap().last_checked_block, 40);
        assert_eq!(reopened.last_processed_block().await, 40);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_advance_height() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        let store = SnapshotStore::open(&path).await.unwrap();
        store.commit_block(10).await.unwrap();

        // A directory squatting on the temp path makes the write fail
        std::fs::create_dir(tmp_path(&path)).unwrap();
        assert!(store.commit_block(20).await.is_err());
        assert_eq!(store.last_processed_block().await, 10);

        std::fs::remove_dir(tmp_path(&path)).unwrap();
        assert_eq!(store.commit_block(20).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SnapshotStore::open(&path).await,
            Err(PersistenceError::Corrupt { .. })
        ));
    }
}
