//! Ping: the long-poll.
//!
//! The handler subscribes to the change bus for the requested collections
//! and suspends until something changes or the heartbeat expires. The
//! subscription unregisters on drop, so a client that hangs up releases
//! its slot the moment hyper abandons the future; no response is written
//! for an abandoned poll.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use esta_store::mail;
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

const DEFAULT_HEARTBEAT_SECS: u64 = 900;
const MIN_HEARTBEAT_SECS: u64 = 60;
const MAX_HEARTBEAT_SECS: u64 = 3540;
const MAX_FOLDERS: usize = 64;

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let Some(doc) = doc.filter(|d| d.tag == "Ping") else {
        // An empty Ping re-uses cached parameters on a real Exchange; we
        // ask the client to restate them instead.
        return status_response(log, 3, &[]);
    };

    let heartbeat = doc
        .child_text("HeartbeatInterval")
        .and_then(|h| h.parse::<u64>().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_SECS)
        .clamp(MIN_HEARTBEAT_SECS, MAX_HEARTBEAT_SECS);

    let mut collection_ids = Vec::new();
    if let Some(folders) = doc.child("Folders") {
        for folder in folders.children_named("Folder") {
            if let Some(id) = folder.child_text("Id") {
                collection_ids.push(id.to_string());
            }
        }
    }
    if collection_ids.is_empty() {
        return status_response(log, 3, &[]);
    }
    if collection_ids.len() > MAX_FOLDERS {
        return status_response(log, 6, &[]);
    }
    if collection_ids.iter().any(|id| mail::folder(id).is_none()) {
        // A folder we never advertised: the hierarchy is out of date.
        return status_response(log, 7, &[]);
    }

    let mut subscription = engine.bus().subscribe(&ctx.user.email, &collection_ids);
    let deadline = tokio::time::sleep(Duration::from_secs(heartbeat));
    tokio::pin!(deadline);

    let mut changed: BTreeSet<String> = BTreeSet::new();
    tokio::select! {
        _ = &mut deadline => {}
        event = subscription.recv() => {
            if let Some(event) = event {
                changed.insert(event.collection_id);
                // Coalesce whatever else is already queued, then answer.
                while let Some(more) = subscription.try_recv() {
                    changed.insert(more.collection_id);
                }
            }
        }
    }

    if changed.is_empty() {
        status_response(log, 1, &[])
    } else {
        let changed: Vec<String> = changed.into_iter().collect();
        status_response(log, 2, &changed)
    }
}

fn status_response(
    log: &mut RequestLog,
    status: u8,
    changed: &[String],
) -> Result<CommandOutcome> {
    log.status = Some(status.to_string());
    let mut response = Element::new(pages::PING, "Ping").str("Status", status.to_string());
    if !changed.is_empty() {
        let mut folders = Element::new(pages::PING, "Folders");
        for id in changed {
            folders.push(Element::new(pages::PING, "Folder").str("Id", id.clone()));
        }
        response = response.node(folders);
    }
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eas::strategy::ClientStrategy;
    use esta_store::mail::store::{Envelope, MailStore};
    use esta_store::notify::ChangeBus;
    use esta_store::oof::OofRegistry;
    use esta_user::config::AutodiscoverConfig;
    use esta_user::login::static_provider::StaticLoginProvider;

    const ALICE: &str = "alice@example.tld";

    fn engine() -> Arc<EasEngine> {
        let login = Arc::new(
            StaticLoginProvider::from_clear_entries(&[(ALICE, "hunter2")]).unwrap(),
        );
        let store = MailStore::new(ChangeBus::new());
        EasEngine::new(
            login,
            store,
            Arc::new(OofRegistry::new()),
            AutodiscoverConfig::default(),
            None,
        )
    }

    fn ctx() -> RequestContext {
        RequestContext {
            user: esta_user::login::UserProfile {
                email: ALICE.to_string(),
                display_name: None,
            },
            device_id: "DEV1".to_string(),
            device_type: "iPhone".to_string(),
            user_agent: "Apple-iPhone".to_string(),
            protocol_version: "14.1".to_string(),
            policy_key_header: None,
            strategy: ClientStrategy::detect("Apple-iPhone", "iPhone"),
        }
    }

    fn ping_doc(heartbeat: &str, folder_ids: &[&str]) -> Element {
        let mut folders = Element::new(pages::PING, "Folders");
        for id in folder_ids {
            folders.push(
                Element::new(pages::PING, "Folder")
                    .str("Id", *id)
                    .str("Class", "Email"),
            );
        }
        Element::new(pages::PING, "Ping")
            .str("HeartbeatInterval", heartbeat)
            .node(folders)
    }

    async fn run(engine: &Arc<EasEngine>, doc: Option<&Element>) -> Element {
        let ctx = ctx();
        let mut log = RequestLog::default();
        match handle(engine, &ctx, doc, &mut log).await.unwrap() {
            CommandOutcome::Wbxml(bytes) => wbxml::decode(&bytes).unwrap(),
            _ => panic!("ping answers with wbxml"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expiry_is_status_1() {
        let engine = engine();
        let parsed = run(&engine, Some(&ping_doc("60", &["1"]))).await;
        assert_eq!(parsed.child_text("Status"), Some("1"));
        assert!(parsed.child("Folders").is_none());
    }

    #[tokio::test]
    async fn smtp_ingest_wakes_the_poll() {
        let engine = engine();
        let ctx = ctx();

        let engine2 = engine.clone();
        let waker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine2.store.ingest(
                b"From: bob@example.tld\r\nTo: alice@example.tld\r\nSubject: wake\r\n\r\nhi\r\n",
                &Envelope {
                    from: Some("bob@example.tld".into()),
                    to: vec![ALICE.to_string()],
                },
            );
        });

        let doc = ping_doc("900", &["1"]);
        let mut log = RequestLog::default();
        let parsed = match handle(&engine, &ctx, Some(&doc), &mut log).await.unwrap() {
            CommandOutcome::Wbxml(bytes) => wbxml::decode(&bytes).unwrap(),
            _ => panic!(),
        };
        waker.await.unwrap();

        assert_eq!(parsed.child_text("Status"), Some("2"));
        let folders = parsed.child("Folders").unwrap();
        assert_eq!(folders.child("Folder").unwrap().child_text("Id"), Some("1"));
    }

    #[tokio::test]
    async fn missing_folders_is_status_3() {
        let engine = engine();
        let doc = Element::new(pages::PING, "Ping").str("HeartbeatInterval", "900");
        let parsed = run(&engine, Some(&doc)).await;
        assert_eq!(parsed.child_text("Status"), Some("3"));

        let parsed = run(&engine, None).await;
        assert_eq!(parsed.child_text("Status"), Some("3"));
    }

    #[tokio::test]
    async fn unknown_folder_is_status_7() {
        let engine = engine();
        let parsed = run(&engine, Some(&ping_doc("900", &["1", "99"]))).await;
        assert_eq!(parsed.child_text("Status"), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_clamped() {
        let engine = engine();
        // 1 second requested; the clamp stretches it to 60. With paused
        // time the sleep completes instantly either way; the point is
        // that no panic or early error path triggers.
        let parsed = run(&engine, Some(&ping_doc("1", &["1"]))).await;
        assert_eq!(parsed.child_text("Status"), Some("1"));
    }
}
