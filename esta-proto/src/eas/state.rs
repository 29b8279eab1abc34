//! The per-(user, device, collection) sync state machine.
//!
//! ActiveSync survives flaky radio links by making every exchange
//! replayable: a batch handed to the client stays cached as `pending`
//! until the client proves receipt by sending the new sync key back. A
//! retry with the old key gets the cached bytes verbatim; the arrival of
//! the new key commits the cursor and discards the cache. Violating the
//! replay rule sends iOS into an infinite re-sync loop, so the resend
//! path must not mutate anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// How many shards the row map is split into; contention is per-row
/// anyway, the shards only bound the cost of the outer lock.
const SHARDS: usize = 16;

pub type Triple = (String, String, String);

/// The batch most recently offered and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    /// The full encoded response, replayed byte-for-byte on retry.
    pub wbxml: Vec<u8>,
    /// Email ids covered by the batch.
    pub ids: Vec<u64>,
    /// The key the client will echo to acknowledge.
    pub next_key: String,
    /// Highest id covered; becomes the cursor on commit.
    pub max_email_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub cur_key: String,
    pub next_key: String,
    pub pending: Option<PendingBatch>,
    /// Highest email id the client has durably received.
    pub cursor: u64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            cur_key: "0".to_string(),
            next_key: "1".to_string(),
            pending: None,
            cursor: 0,
        }
    }
}

/// Sync keys are opaque to clients but plain decimal counters inside.
pub fn advance(key: &str) -> String {
    key.parse::<u64>().map(|n| n + 1).unwrap_or(1).to_string()
}

/// What a request's `client_key` means given the current row.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// `client_key == "0"`: (re)initialization.
    Initial,
    /// Retry of the outstanding batch: replay `pending`, touch nothing.
    Resend,
    /// The client acknowledges `next_key`: commit, then build the next batch.
    Ack,
    /// `client_key == cur_key` with nothing outstanding (e.g. after a
    /// restart lost the cache): build a fresh batch, no commit.
    Fresh,
    /// A key we never issued: collection Status 3.
    Invalid,
}

impl SyncState {
    pub fn classify(&self, client_key: &str) -> Disposition {
        // The resend check outranks re-initialization: a retried initial
        // sync (cur_key still "0", batch outstanding) must replay, not
        // rebuild, or the reply stops being byte-stable under retries.
        if self.pending.is_some() && client_key == self.cur_key {
            Disposition::Resend
        } else if client_key == "0" {
            Disposition::Initial
        } else if client_key == self.next_key {
            Disposition::Ack
        } else if client_key == self.cur_key {
            Disposition::Fresh
        } else {
            Disposition::Invalid
        }
    }

    /// Deliberate re-initialization by the client.
    pub fn reset(&mut self) {
        *self = SyncState::default();
    }

    /// Apply an acknowledgement. The cursor only ever moves here.
    pub fn commit(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.cursor = self.cursor.max(pending.max_email_id);
        }
        self.cur_key = self.next_key.clone();
        self.next_key = advance(&self.cur_key);
    }

    /// Install a freshly built batch as the outstanding one.
    pub fn install(&mut self, batch: PendingBatch) {
        debug_assert_eq!(batch.next_key, self.next_key);
        self.pending = Some(batch);
    }
}

/// All sync rows, sharded, each row behind its own async mutex so that a
/// slow batch build for one collection never blocks another triple.
pub struct SyncStateRegistry {
    shards: Vec<Mutex<HashMap<Triple, Arc<tokio::sync::Mutex<SyncState>>>>>,
    state_dir: Option<PathBuf>,
}

impl SyncStateRegistry {
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            state_dir,
        }
    }

    fn shard(&self, triple: &Triple) -> &Mutex<HashMap<Triple, Arc<tokio::sync::Mutex<SyncState>>>> {
        let mut h: usize = 5381;
        for part in [&triple.0, &triple.1, &triple.2] {
            for b in part.as_bytes() {
                h = h.wrapping_mul(33) ^ usize::from(*b);
            }
        }
        &self.shards[h % SHARDS]
    }

    /// Fetch (or revive from snapshot, or create) the row for a triple.
    /// The caller locks the returned mutex for the whole read-modify-write.
    pub fn row(&self, triple: &Triple) -> Arc<tokio::sync::Mutex<SyncState>> {
        let mut shard = self.shard(triple).lock().unwrap();
        if let Some(row) = shard.get(triple) {
            return row.clone();
        }
        let state = self.load_snapshot(triple).unwrap_or_default();
        let row = Arc::new(tokio::sync::Mutex::new(state));
        shard.insert(triple.clone(), row.clone());
        row
    }

    fn snapshot_path(&self, triple: &Triple) -> Option<PathBuf> {
        let dir = self.state_dir.as_ref()?;
        let name = hex::encode(format!("{}\x1f{}\x1f{}", triple.0, triple.1, triple.2));
        Some(dir.join(format!("sync-{}.bin", name)))
    }

    fn load_snapshot(&self, triple: &Triple) -> Option<SyncState> {
        let path = self.snapshot_path(triple)?;
        let bytes = std::fs::read(path).ok()?;
        match rmp_serde::from_read_ref(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(err=%e, "discarding unreadable sync-state snapshot");
                None
            }
        }
    }

    /// Write-through snapshot. Called before the response advertising a
    /// new `next_key` is handed to the transport, so a restart can still
    /// honor the two-phase commit.
    pub async fn persist(&self, triple: &Triple, state: &SyncState) {
        let Some(path) = self.snapshot_path(triple) else {
            return;
        };
        match rmp_serde::to_vec(state) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(err=%e, path=%path.display(), "failed to write sync snapshot");
                }
            }
            Err(e) => tracing::warn!(err=%e, "failed to serialize sync state"),
        }
    }
}
