//! GetItemEstimate: how many items a full sync of a collection would
//! bring down, measured from the committed cursor.

use std::sync::Arc;

use anyhow::Result;

use esta_store::mail;
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::state::Triple;
use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let collections: Vec<&Element> = doc
        .filter(|d| d.tag == "GetItemEstimate")
        .and_then(|d| d.child("Collections"))
        .map(|c| c.children_named("Collection").collect())
        .unwrap_or_default();

    if collections.is_empty() {
        log.status = Some("2".to_string());
        let response = Element::new(pages::ESTIMATE, "GetItemEstimate").str("Status", "2");
        return Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?));
    }

    let mut response = Element::new(pages::ESTIMATE, "GetItemEstimate");
    for collection in collections {
        let collection_id = collection
            .child_text("CollectionId")
            .unwrap_or_default()
            .to_string();

        let inner = match mail::folder(&collection_id) {
            // 2: unknown collection.
            None => Element::new(pages::ESTIMATE, "Response")
                .str("Status", "2")
                .node(
                    Element::new(pages::ESTIMATE, "Collection")
                        .str("CollectionId", collection_id.clone()),
                ),
            Some(folder) => {
                let triple: Triple = (
                    ctx.user.email.clone(),
                    ctx.device_id.clone(),
                    collection_id.clone(),
                );
                let row = engine.sync_states.row(&triple);
                let cursor = row.lock().await.cursor;
                let estimate = if folder.class == "Email" {
                    engine
                        .store
                        .count_since(&ctx.user.email, &collection_id, cursor)
                } else {
                    0
                };
                Element::new(pages::ESTIMATE, "Response")
                    .str("Status", "1")
                    .node(
                        Element::new(pages::ESTIMATE, "Collection")
                            .str("Class", folder.class)
                            .str("CollectionId", collection_id.clone())
                            .str("Estimate", estimate.to_string()),
                    )
            }
        };
        response.push(inner);
    }

    log.status = Some("1".to_string());
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

    fn estimate_doc(collection_id: &str) -> Element {
        Element::new(pages::ESTIMATE, "GetItemEstimate").node(
            Element::new(pages::ESTIMATE, "Collections").node(
                Element::new(pages::ESTIMATE, "Collection")
                    .str("Class", "Email")
                    .str("CollectionId", collection_id)
                    .str_on(pages::AIRSYNC, "SyncKey", "1"),
            ),
        )
    }

    #[tokio::test]
    async fn counts_emails_past_the_cursor() {
        let engine = engine();
        for _ in 0..4 {
            engine.store.ingest(
                b"From: bob@example.tld\r\nTo: alice@example.tld\r\nSubject: x\r\n\r\nb\r\n",
                &Envelope {
                    from: None,
                    to: vec![ALICE.to_string()],
                },
            );
        }

        let ctx = ctx();
        let mut log = RequestLog::default();
        let outcome = handle(&engine, &ctx, Some(&estimate_doc("1")), &mut log)
            .await
            .unwrap();
        let parsed = match outcome {
            CommandOutcome::Wbxml(bytes) => wbxml::decode(&bytes).unwrap(),
            _ => panic!(),
        };
        let response = parsed.child("Response").unwrap();
        assert_eq!(response.child_text("Status"), Some("1"));
        assert_eq!(
            response.child("Collection").unwrap().child_text("Estimate"),
            Some("4")
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_status_2() {
        let engine = engine();
        let ctx = ctx();
        let mut log = RequestLog::default();
        let outcome = handle(&engine, &ctx, Some(&estimate_doc("99")), &mut log)
            .await
            .unwrap();
        let parsed = match outcome {
            CommandOutcome::Wbxml(bytes) => wbxml::decode(&bytes).unwrap(),
            _ => panic!(),
        };
        assert_eq!(
            parsed.child("Response").unwrap().child_text("Status"),
            Some("2")
        );
    }
}
