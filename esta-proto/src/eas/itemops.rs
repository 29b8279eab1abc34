//! ItemOperations: inline Fetch of a full item by ServerId.

use std::sync::Arc;

use anyhow::Result;

use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::body::{select_body, BodyPreference};
use crate::eas::{parse_server_id, CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let fetches: Vec<&Element> = doc
        .filter(|d| d.tag == "ItemOperations")
        .map(|d| d.children_named("Fetch").collect())
        .unwrap_or_default();

    if fetches.is_empty() {
        log.status = Some("2".to_string());
        let response = Element::new(pages::ITEMOPS, "ItemOperations").str("Status", "2");
        return Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?));
    }

    let mut responses = Element::new(pages::ITEMOPS, "Response");
    for fetch in fetches {
        let server_id = fetch
            .descendant("ServerId")
            .and_then(|e| e.text())
            .unwrap_or_default()
            .to_string();

        let body_type = fetch
            .descendant("BodyPreference")
            .and_then(|bp| bp.child_text("Type"))
            .and_then(|t| t.parse::<u8>().ok())
            .unwrap_or(1);

        let email = parse_server_id(&server_id)
            .and_then(|(_, id)| engine.store.fetch_email(&ctx.user.email, id));

        let inner = match email {
            None => Element::new(pages::ITEMOPS, "Fetch")
                // 6: the referenced object was not found.
                .str("Status", "6")
                .str_on(pages::AIRSYNC, "ServerId", server_id.clone()),
            Some(email) => {
                // ItemOperations serves the whole thing; no truncation.
                let prefs = [BodyPreference {
                    body_type,
                    truncation_size: None,
                    all_or_none: false,
                }];
                let body = select_body(&email, &prefs, ctx.strategy, false);
                Element::new(pages::ITEMOPS, "Fetch")
                    .str("Status", "1")
                    .str_on(pages::AIRSYNC, "ServerId", server_id.clone())
                    .str_on(pages::AIRSYNC, "Class", "Email")
                    .node(
                        Element::new(pages::ITEMOPS, "Properties")
                            .node(
                                Element::new(pages::AIRSYNCBASE, "Body")
                                    .str("Type", body.body_type.to_string())
                                    .str("EstimatedDataSize", body.estimated_size.to_string())
                                    .str("Truncated", "0")
                                    .opaque("Data", body.data.clone()),
                            )
                            .str_on(
                                pages::AIRSYNCBASE,
                                "NativeBodyType",
                                email.native_body_type().to_string(),
                            ),
                    )
            }
        };
        responses.push(inner);
    }

    log.status = Some("1".to_string());
    let response = Element::new(pages::ITEMOPS, "ItemOperations")
        .str("Status", "1")
        .node(responses);
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}
