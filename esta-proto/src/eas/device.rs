//! The device registry.
//!
//! One row per `(user, device_id)` pair, created on the first authenticated
//! request and refreshed on every one after that. The row carries the
//! provisioning state: the current policy key gating all non-exempt
//! commands, and the pending key issued by a phase-1 Provision that has
//! not been acknowledged yet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A pending phase-1 key is honored for this long.
const PENDING_KEY_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user: String,
    pub device_id: String,
    pub device_type: String,
    pub user_agent: String,

    /// Zero means "not provisioned"; the gate rejects the device.
    pub policy_key: u32,
    pub pending_policy_key: Option<(u32, DateTime<Utc>)>,
    pub is_provisioned: bool,

    /// FolderSync counter, bumped when the hierarchy changes.
    pub folder_hierarchy_key: u64,

    // DeviceInformation metadata, stored as a courtesy.
    pub model: Option<String>,
    pub friendly_name: Option<String>,
    pub os: Option<String>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    rows: Mutex<HashMap<(String, String), DeviceRecord>>,
    snapshot: Option<PathBuf>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(path: PathBuf) -> Self {
        let rows = match std::fs::read(&path) {
            Ok(bytes) => match rmp_serde::from_read_ref(&bytes) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(err=%e, "discarding unreadable device snapshot");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            rows: Mutex::new(rows),
            snapshot: Some(path),
        }
    }

    /// Create or refresh the row for this request and return a copy.
    pub fn upsert(
        &self,
        user: &str,
        device_id: &str,
        device_type: &str,
        user_agent: &str,
    ) -> DeviceRecord {
        let mut rows = self.rows.lock().unwrap();
        let record = rows
            .entry((user.to_string(), device_id.to_string()))
            .or_insert_with(|| DeviceRecord {
                user: user.to_string(),
                device_id: device_id.to_string(),
                device_type: String::new(),
                user_agent: String::new(),
                policy_key: 0,
                pending_policy_key: None,
                is_provisioned: false,
                folder_hierarchy_key: 1,
                model: None,
                friendly_name: None,
                os: None,
            });
        if !device_type.is_empty() {
            record.device_type = device_type.to_string();
        }
        if !user_agent.is_empty() {
            record.user_agent = user_agent.to_string();
        }
        let copy = record.clone();
        self.persist(&rows);
        copy
    }

    pub fn get(&self, user: &str, device_id: &str) -> Option<DeviceRecord> {
        let rows = self.rows.lock().unwrap();
        rows.get(&(user.to_string(), device_id.to_string())).cloned()
    }

    /// Phase 1 of provisioning. An unexpired pending key is reused so that
    /// a delayed phase-2 acknowledgement still cites a key we recognize;
    /// rotating on every retry sends clients into a loop.
    pub fn issue_temp_policy_key(&self, user: &str, device_id: &str) -> Result<u32> {
        let mut rows = self.rows.lock().unwrap();
        let Some(record) = rows.get_mut(&(user.to_string(), device_id.to_string())) else {
            bail!("unknown device {}/{}", user, device_id);
        };

        let now = Utc::now();
        if let Some((key, issued)) = record.pending_policy_key {
            if now - issued < Duration::minutes(PENDING_KEY_TTL_MINUTES) {
                return Ok(key);
            }
        }

        let key: u32 = rand::thread_rng().gen_range(1..=u32::MAX);
        record.pending_policy_key = Some((key, now));
        self.persist(&rows);
        Ok(key)
    }

    /// Phase 2: promote a pending key the client echoed back.
    pub fn promote_policy_key(&self, user: &str, device_id: &str, acked: u32) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let Some(record) = rows.get_mut(&(user.to_string(), device_id.to_string())) else {
            bail!("unknown device {}/{}", user, device_id);
        };

        match record.pending_policy_key {
            Some((key, issued))
                if key == acked
                    && Utc::now() - issued < Duration::minutes(PENDING_KEY_TTL_MINUTES) =>
            {
                record.policy_key = key;
                record.is_provisioned = true;
                record.pending_policy_key = None;
                self.persist(&rows);
                Ok(())
            }
            _ => bail!("acknowledged policy key does not match the pending key"),
        }
    }

    pub fn update_device_info(
        &self,
        user: &str,
        device_id: &str,
        model: Option<String>,
        friendly_name: Option<String>,
        os: Option<String>,
    ) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(record) = rows.get_mut(&(user.to_string(), device_id.to_string())) {
            if model.is_some() {
                record.model = model;
            }
            if friendly_name.is_some() {
                record.friendly_name = friendly_name;
            }
            if os.is_some() {
                record.os = os;
            }
            self.persist(&rows);
        }
    }

    fn persist(&self, rows: &HashMap<(String, String), DeviceRecord>) {
        let Some(path) = &self.snapshot else { return };
        match rmp_serde::to_vec(rows) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    tracing::warn!(err=%e, "failed to write device snapshot");
                }
            }
            Err(e) => tracing::warn!(err=%e, "failed to serialize device rows"),
        }
    }
}

impl DeviceRecord {
    /// The provisioning gate: a device passes when it has been through the
    /// two-phase handshake and presents its current key. A literal
    /// `X-MS-PolicyKey: 0` never passes, even though it equals the stored
    /// key of an unprovisioned row.
    pub fn policy_gate(&self, presented: Option<u32>) -> bool {
        self.is_provisioned && self.policy_key != 0 && presented == Some(self.policy_key)
    }
}
