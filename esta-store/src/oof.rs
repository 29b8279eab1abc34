//! Out-of-office rows, consulted by the Settings command and the SMTP
//! ingest path.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OofState {
    #[default]
    Disabled,
    Enabled,
    Scheduled,
}

impl OofState {
    pub fn code(&self) -> u8 {
        match self {
            OofState::Disabled => 0,
            OofState::Enabled => 1,
            OofState::Scheduled => 2,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(OofState::Disabled),
            "1" => Some(OofState::Enabled),
            "2" => Some(OofState::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExternalAudience {
    #[default]
    None,
    Known,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OofMessage {
    pub enabled: bool,
    pub reply: String,
    pub body_type: String,
}

impl Default for OofMessage {
    fn default() -> Self {
        Self {
            enabled: false,
            reply: String::new(),
            body_type: "Text".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OofSettings {
    pub state: OofState,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub internal: OofMessage,
    pub external_known: OofMessage,
    pub external_unknown: OofMessage,
    pub external_audience: ExternalAudience,
}

impl OofSettings {
    fn active_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            OofState::Disabled => false,
            OofState::Enabled => true,
            OofState::Scheduled => match (self.start, self.end) {
                (Some(start), Some(end)) => start <= now && now <= end,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OofRow {
    settings: OofSettings,
    /// Senders already auto-replied to, to suppress duplicates.
    replied: HashSet<String>,
}

pub struct OofRegistry {
    rows: Mutex<HashMap<String, OofRow>>,
    snapshot: Option<PathBuf>,
}

impl OofRegistry {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            snapshot: None,
        }
    }

    pub fn with_snapshot(path: PathBuf) -> Self {
        let rows = match std::fs::read(&path) {
            Ok(bytes) => match rmp_serde::from_read_ref(&bytes) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(err=%e, "discarding unreadable OOF snapshot");
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

    pub fn get(&self, user: &str) -> OofSettings {
        let rows = self.rows.lock().unwrap();
        rows.get(user).map(|r| r.settings.clone()).unwrap_or_default()
    }

    /// Replace the whole document atomically. Changing the OOF settings
    /// starts a fresh absence, so the replied-senders set is reset.
    pub fn set(&self, user: &str, settings: OofSettings) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert(
            user.to_string(),
            OofRow {
                settings,
                replied: HashSet::new(),
            },
        );
        self.persist(&rows);
        Ok(())
    }

    /// Decide whether `sender` gets an automatic reply from `user` right
    /// now, and if so which text. Marks the sender as replied-to.
    pub fn auto_reply(&self, user: &str, sender: &str) -> Option<String> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(user)?;
        if !row.settings.active_at(now) {
            return None;
        }
        if row.replied.contains(sender) {
            return None;
        }

        let internal = user.rsplit('@').next() == sender.rsplit('@').next();
        let message = if internal {
            &row.settings.internal
        } else {
            match row.settings.external_audience {
                ExternalAudience::None => return None,
                ExternalAudience::Known => &row.settings.external_known,
                ExternalAudience::All => &row.settings.external_unknown,
            }
        };
        if !message.enabled || message.reply.is_empty() {
            return None;
        }
        let reply = message.reply.clone();
        row.replied.insert(sender.to_string());
        self.persist(&rows);
        Some(reply)
    }

    fn persist(&self, rows: &HashMap<String, OofRow>) {
        let Some(path) = &self.snapshot else { return };
        match rmp_serde::to_vec(rows) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    tracing::warn!(err=%e, "failed to write OOF snapshot");
                }
            }
            Err(e) => tracing::warn!(err=%e, "failed to serialize OOF rows"),
        }
    }
}

impl Default for OofRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn enabled_settings() -> OofSettings {
        OofSettings {
            state: OofState::Enabled,
            internal: OofMessage {
                enabled: true,
                reply: "away until Monday".into(),
                body_type: "Text".into(),
            },
            external_audience: ExternalAudience::None,
            ..OofSettings::default()
        }
    }

    #[test]
    fn replies_once_per_sender() {
        let reg = OofRegistry::new();
        reg.set("alice@example.tld", enabled_settings()).unwrap();

        assert_eq!(
            reg.auto_reply("alice@example.tld", "bob@example.tld").as_deref(),
            Some("away until Monday")
        );
        assert_eq!(reg.auto_reply("alice@example.tld", "bob@example.tld"), None);
        // A different sender still gets one.
        assert!(reg.auto_reply("alice@example.tld", "carol@example.tld").is_some());
    }

    #[test]
    fn disabled_and_external_audience_none() {
        let reg = OofRegistry::new();
        reg.set("alice@example.tld", OofSettings::default()).unwrap();
        assert_eq!(reg.auto_reply("alice@example.tld", "bob@example.tld"), None);

        reg.set("alice@example.tld", enabled_settings()).unwrap();
        // External sender, audience None: stays quiet.
        assert_eq!(reg.auto_reply("alice@example.tld", "bob@other.tld"), None);
    }

    #[test]
    fn scheduled_window() {
        let reg = OofRegistry::new();
        let now = Utc::now();

        let mut inside = enabled_settings();
        inside.state = OofState::Scheduled;
        inside.start = Some(now - Duration::hours(1));
        inside.end = Some(now + Duration::hours(1));
        reg.set("alice@example.tld", inside).unwrap();
        assert!(reg.auto_reply("alice@example.tld", "bob@example.tld").is_some());

        let mut past = enabled_settings();
        past.state = OofState::Scheduled;
        past.start = Some(now - Duration::hours(3));
        past.end = Some(now - Duration::hours(2));
        reg.set("alice@example.tld", past).unwrap();
        assert_eq!(reg.auto_reply("alice@example.tld", "bob@example.tld"), None);
    }

    #[test]
    fn set_resets_replied_senders() {
        let reg = OofRegistry::new();
        reg.set("alice@example.tld", enabled_settings()).unwrap();
        assert!(reg.auto_reply("alice@example.tld", "bob@example.tld").is_some());

        reg.set("alice@example.tld", enabled_settings()).unwrap();
        assert!(reg.auto_reply("alice@example.tld", "bob@example.tld").is_some());
    }
}
