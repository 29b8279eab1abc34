//! The in-process mail store.
//!
//! Emails are owned here; the protocol engine holds id references only.
//! Every user gets a private monotonic id sequence, so a collection cursor
//! ("highest id committed") is a complete pagination position.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::mail::{self, parse_mail, Email};
use crate::notify::ChangeBus;

/// SMTP envelope as the ingest path sees it: already resolved to local
/// recipients by the listener.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: Option<String>,
    pub to: Vec<String>,
}

#[derive(Default)]
struct UserMailbox {
    next_id: u64,
    emails: BTreeMap<u64, Email>,
}

pub struct MailStore {
    inner: Mutex<HashMap<String, UserMailbox>>,
    bus: Arc<ChangeBus>,
}

impl MailStore {
    pub fn new(bus: Arc<ChangeBus>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            bus,
        })
    }

    pub fn change_bus(&self) -> Arc<ChangeBus> {
        self.bus.clone()
    }

    /// Emails in a folder with `id > since_id`, ascending, at most `limit`.
    pub fn list_emails(&self, user: &str, folder_id: &str, since_id: u64, limit: usize) -> Vec<Email> {
        let inner = self.inner.lock().unwrap();
        let Some(mbx) = inner.get(user) else {
            return vec![];
        };
        mbx.emails
            .range(since_id + 1..)
            .filter(|(_, e)| e.folder_id == folder_id)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count_since(&self, user: &str, folder_id: &str, since_id: u64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .get(user)
            .map(|mbx| {
                mbx.emails
                    .range(since_id + 1..)
                    .filter(|(_, e)| e.folder_id == folder_id)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn fetch_email(&self, user: &str, id: u64) -> Option<Email> {
        let inner = self.inner.lock().unwrap();
        inner.get(user).and_then(|mbx| mbx.emails.get(&id)).cloned()
    }

    pub fn mark_read(&self, user: &str, id: u64, flag: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let email = inner
            .get_mut(user)
            .and_then(|mbx| mbx.emails.get_mut(&id))
            .ok_or_else(|| anyhow!("no email {} for {}", id, user))?;
        email.is_read = flag;
        Ok(())
    }

    /// Soft delete: first deletion moves to Deleted Items, a second one
    /// drops the record.
    pub fn delete(&self, user: &str, id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mbx = inner
            .get_mut(user)
            .ok_or_else(|| anyhow!("no mailbox for {}", user))?;
        let email = mbx
            .emails
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no email {} for {}", id, user))?;
        if email.folder_id == mail::DELETED {
            mbx.emails.remove(&id);
        } else {
            email.folder_id = mail::DELETED.to_string();
        }
        Ok(())
    }

    pub fn move_email(&self, user: &str, id: u64, dst_folder: &str) -> Result<u64> {
        if mail::folder(dst_folder).is_none() {
            return Err(anyhow!("unknown destination folder {}", dst_folder));
        }
        let mut inner = self.inner.lock().unwrap();
        let email = inner
            .get_mut(user)
            .and_then(|mbx| mbx.emails.get_mut(&id))
            .ok_or_else(|| anyhow!("no email {} for {}", id, user))?;
        email.folder_id = dst_folder.to_string();
        Ok(id)
    }

    /// Deliver one message to every envelope recipient's Inbox and wake
    /// Ping subscribers. Returns the assigned ids, envelope order.
    pub fn ingest(&self, raw: &[u8], envelope: &Envelope) -> Vec<u64> {
        let mut ids = Vec::with_capacity(envelope.to.len());
        for rcpt in &envelope.to {
            let id = self.insert(rcpt, mail::INBOX, raw, false);
            // The event goes out only after the record is in place, so a
            // Ping waking on it always finds the email.
            self.bus.publish(rcpt, mail::INBOX);
            ids.push(id);
        }
        ids
    }

    /// Sent-Items copy for SendMail/SmartReply; no change event, devices
    /// learn about it when they sync the folder.
    pub fn ingest_sent(&self, user: &str, raw: &[u8]) -> u64 {
        self.insert(user, mail::SENT, raw, true)
    }

    fn insert(&self, user: &str, folder_id: &str, raw: &[u8], read: bool) -> u64 {
        let parsed = parse_mail(raw);
        let mut inner = self.inner.lock().unwrap();
        let mbx = inner.entry(user.to_string()).or_default();
        mbx.next_id += 1;
        let id = mbx.next_id;
        mbx.emails.insert(
            id,
            Email {
                id,
                folder_id: folder_id.to_string(),
                subject: parsed.subject,
                from: parsed.from,
                to: parsed.to,
                date_received: parsed.date.unwrap_or_else(Utc::now),
                is_read: read,
                message_class: "IPM.Note".to_string(),
                mime: Arc::new(raw.to_vec()),
                body_plain: parsed.body_plain,
                body_html: parsed.body_html,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: alice@example.tld\r\nTo: bob@example.tld\r\nSubject: one\r\n\r\nhello\r\n";

    fn store() -> Arc<MailStore> {
        MailStore::new(ChangeBus::new())
    }

    fn envelope_to(user: &str) -> Envelope {
        Envelope {
            from: Some("alice@example.tld".into()),
            to: vec![user.to_string()],
        }
    }

    #[test]
    fn ids_are_monotonic_per_user() {
        let store = store();
        let a = store.ingest(RAW, &envelope_to("bob@example.tld"))[0];
        let b = store.ingest(RAW, &envelope_to("bob@example.tld"))[0];
        let c = store.ingest(RAW, &envelope_to("carol@example.tld"))[0];
        assert_eq!((a, b), (1, 2));
        assert_eq!(c, 1);
    }

    #[test]
    fn list_respects_cursor_and_limit() {
        let store = store();
        for _ in 0..5 {
            store.ingest(RAW, &envelope_to("bob@example.tld"));
        }
        let page = store.list_emails("bob@example.tld", mail::INBOX, 2, 2);
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(store.count_since("bob@example.tld", mail::INBOX, 2), 3);
    }

    #[test]
    fn soft_delete_then_purge() {
        let store = store();
        let id = store.ingest(RAW, &envelope_to("bob@example.tld"))[0];

        store.delete("bob@example.tld", id).unwrap();
        let email = store.fetch_email("bob@example.tld", id).unwrap();
        assert_eq!(email.folder_id, mail::DELETED);

        store.delete("bob@example.tld", id).unwrap();
        assert!(store.fetch_email("bob@example.tld", id).is_none());
    }

    #[test]
    fn mark_read_flips_flag_only() {
        let store = store();
        let id = store.ingest(RAW, &envelope_to("bob@example.tld"))[0];
        store.mark_read("bob@example.tld", id, true).unwrap();
        assert!(store.fetch_email("bob@example.tld", id).unwrap().is_read);
        store.mark_read("bob@example.tld", id, false).unwrap();
        assert!(!store.fetch_email("bob@example.tld", id).unwrap().is_read);
    }

    #[tokio::test]
    async fn ingest_publishes_after_persisting() {
        let bus = ChangeBus::new();
        let store = MailStore::new(bus.clone());
        let mut sub = bus.subscribe("bob@example.tld", &[mail::INBOX.to_string()]);

        store.ingest(RAW, &envelope_to("bob@example.tld"));

        let evt = sub.recv().await.unwrap();
        assert_eq!(evt.collection_id, mail::INBOX);
        assert_eq!(store.count_since("bob@example.tld", mail::INBOX, 0), 1);
    }

    #[test]
    fn sent_copy_is_read_and_quiet() {
        let store = store();
        let id = store.ingest_sent("alice@example.tld", RAW);
        let email = store.fetch_email("alice@example.tld", id).unwrap();
        assert_eq!(email.folder_id, mail::SENT);
        assert!(email.is_read);
    }
}
