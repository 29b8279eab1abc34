//! MoveItems: move messages between folders.

use std::sync::Arc;

use anyhow::Result;

use esta_store::mail;
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{format_server_id, parse_server_id, CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let moves: Vec<&Element> = doc
        .filter(|d| d.tag == "MoveItems")
        .map(|d| d.children_named("Move").collect())
        .unwrap_or_default();

    if moves.is_empty() {
        log.status = Some("2".to_string());
        let response = Element::new(pages::MOVE, "MoveItems").str("Status", "2");
        return Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?));
    }

    let mut response = Element::new(pages::MOVE, "MoveItems");
    for mv in moves {
        let src_msg_id = mv.child_text("SrcMsgId").unwrap_or_default().to_string();
        let dst_fld_id = mv.child_text("DstFldId").unwrap_or_default().to_string();

        // MS-ASMOVE status values read oddly: 3 is success, 1 is an
        // invalid source, 2 an invalid destination.
        let (status, dst_msg_id) = match (
            parse_server_id(&src_msg_id),
            mail::folder(&dst_fld_id),
        ) {
            (Some((_, id)), Some(_)) => {
                match engine.store.move_email(&ctx.user.email, id, &dst_fld_id) {
                    Ok(new_id) => ("3", Some(format_server_id(&dst_fld_id, new_id))),
                    Err(_) => ("1", None),
                }
            }
            (None, _) => ("1", None),
            (_, None) => ("2", None),
        };

        let mut inner = Element::new(pages::MOVE, "Response")
            .str("SrcMsgId", src_msg_id.clone())
            .str("Status", status);
        if let Some(dst) = dst_msg_id {
            inner = inner.str("DstMsgId", dst);
        }
        response.push(inner);
    }

    log.status = Some("1".to_string());
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}
