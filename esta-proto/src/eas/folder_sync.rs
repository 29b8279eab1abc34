//! FolderSync: the folder hierarchy, with its own sync-key counter.
//!
//! The hierarchy is static, so the interesting part is key handling: an
//! initial request (`SyncKey=0`) always answers `SyncKey=1` with the full
//! hierarchy, whatever counter the server is at, which is how devices
//! with wiped local state recover. Retries are idempotent because the
//! document is a pure function of the key.

use std::sync::Arc;

use anyhow::Result;

use esta_store::mail::FOLDERS;
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let sync_key = doc
        .filter(|d| d.tag == "FolderSync")
        .and_then(|d| d.child_text("SyncKey"))
        .unwrap_or("0")
        .to_string();
    log.sync_key_in = Some(sync_key.clone());

    let device = engine
        .devices
        .get(&ctx.user.email, &ctx.device_id);
    let current_key = device.map(|d| d.folder_hierarchy_key).unwrap_or(1);

    let response = if sync_key == "0" {
        log.sync_key_out = Some("1".to_string());
        log.status = Some("1".to_string());
        full_hierarchy_response()
    } else if sync_key == current_key.to_string() {
        // Known key, nothing changed.
        log.sync_key_out = Some(sync_key.clone());
        log.status = Some("1".to_string());
        Element::new(pages::FOLDERS, "FolderSync")
            .str("Status", "1")
            .str("SyncKey", sync_key)
            .node(Element::new(pages::FOLDERS, "Changes").str("Count", "0"))
    } else {
        // A key we never issued: the client must re-initialize.
        log.status = Some("9".to_string());
        Element::new(pages::FOLDERS, "FolderSync").str("Status", "9")
    };

    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}

fn full_hierarchy_response() -> Element {
    let mut changes =
        Element::new(pages::FOLDERS, "Changes").str("Count", FOLDERS.len().to_string());
    for folder in FOLDERS {
        changes.push(
            Element::new(pages::FOLDERS, "Add")
                .str("ServerId", folder.id)
                .str("ParentId", folder.parent_id)
                .str("DisplayName", folder.display_name)
                .str("Type", folder.type_code.to_string()),
        );
    }
    Element::new(pages::FOLDERS, "FolderSync")
        .str("Status", "1")
        .str("SyncKey", "1")
        .node(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eas::strategy::ClientStrategy;
    use esta_store::mail::store::MailStore;
    use esta_store::notify::ChangeBus;
    use esta_store::oof::OofRegistry;
    use esta_user::config::AutodiscoverConfig;
    use esta_user::login::static_provider::StaticLoginProvider;

    fn engine() -> Arc<EasEngine> {
        let login = Arc::new(
            StaticLoginProvider::from_clear_entries(&[("alice@example.tld", "hunter2")]).unwrap(),
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
                email: "alice@example.tld".to_string(),
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

    fn folder_sync_doc(key: &str) -> Element {
        Element::new(pages::FOLDERS, "FolderSync").str("SyncKey", key)
    }

    async fn run(engine: &Arc<EasEngine>, doc: &Element) -> (Vec<u8>, Element) {
        let ctx = ctx();
        engine.devices.upsert(&ctx.user.email, &ctx.device_id, "iPhone", "Apple-iPhone");
        let mut log = RequestLog::default();
        match handle(engine, &ctx, Some(doc), &mut log).await.unwrap() {
            CommandOutcome::Wbxml(bytes) => {
                let parsed = wbxml::decode(&bytes).unwrap();
                (bytes, parsed)
            }
            _ => panic!("foldersync answers with wbxml"),
        }
    }

    #[tokio::test]
    async fn initial_returns_key_one_and_full_hierarchy() {
        let engine = engine();
        let (_, parsed) = run(&engine, &folder_sync_doc("0")).await;
        assert_eq!(parsed.child_text("Status"), Some("1"));
        assert_eq!(parsed.child_text("SyncKey"), Some("1"));

        let changes = parsed.child("Changes").unwrap();
        assert_eq!(changes.child_text("Count"), Some("7"));
        let adds: Vec<_> = changes.children_named("Add").collect();
        assert_eq!(adds.len(), 7);
        assert!(adds
            .iter()
            .any(|a| a.child_text("DisplayName") == Some("Inbox")));
    }

    #[tokio::test]
    async fn retries_are_byte_identical() {
        let engine = engine();
        let (bytes_a, _) = run(&engine, &folder_sync_doc("0")).await;
        let (bytes_b, _) = run(&engine, &folder_sync_doc("0")).await;
        assert_eq!(bytes_a, bytes_b);
    }

    #[tokio::test]
    async fn current_key_reports_no_changes() {
        let engine = engine();
        run(&engine, &folder_sync_doc("0")).await;
        let (_, parsed) = run(&engine, &folder_sync_doc("1")).await;
        assert_eq!(parsed.child_text("SyncKey"), Some("1"));
        assert_eq!(
            parsed.child("Changes").unwrap().child_text("Count"),
            Some("0")
        );
    }

    #[tokio::test]
    async fn unknown_key_is_status_9() {
        let engine = engine();
        let (_, parsed) = run(&engine, &folder_sync_doc("41")).await;
        assert_eq!(parsed.child_text("Status"), Some("9"));
    }
}
