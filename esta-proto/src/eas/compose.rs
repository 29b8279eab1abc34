//! SendMail, SmartForward and SmartReply.
//!
//! 14.x clients wrap the outgoing message in ComposeMail WBXML with the
//! MIME bytes as one opaque blob; older ones POST the raw MIME directly.
//! Either way the payload is delivered to every local recipient through
//! the store (which wakes their Ping handlers) and optionally copied to
//! Sent Items. Success is an empty 200 response; a WBXML body in the
//! answer means failure.

use std::sync::Arc;

use anyhow::Result;

use esta_store::mail::store::Envelope;
use esta_wbxml::{pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    cmd: &str,
    doc: Option<&Element>,
    raw_body: &[u8],
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let (mime, save_in_sent) = match doc {
        Some(doc) if doc.tag == cmd => {
            let Some(mime) = doc.child("Mime").and_then(|m| m.opaque_bytes()) else {
                return failure(cmd, log);
            };
            (mime.to_vec(), doc.has_child("SaveInSentItems"))
        }
        // Legacy raw-MIME variant: the whole POST body is the message.
        // The `SaveInSent=T` query parameter is not threaded through
        // here, so a copy is kept unconditionally.
        None if !raw_body.is_empty() => (raw_body.to_vec(), true),
        _ => return failure(cmd, log),
    };

    deliver(engine, ctx, &mime, save_in_sent).await;
    log.status = Some("1".to_string());
    Ok(CommandOutcome::Empty)
}

async fn deliver(engine: &Arc<EasEngine>, ctx: &RequestContext, mime: &[u8], save_in_sent: bool) {
    let mut recipients = Vec::new();
    // Only mailboxes we host. Outbound relaying to foreign domains is the
    // MTA's job, not the protocol engine's.
    for addr in parse_recipients(mime) {
        if engine.login.lookup(&addr).await.is_ok() {
            recipients.push(addr);
        } else {
            tracing::debug!(rcpt=%addr, "dropping non-local recipient");
        }
    }
    if !recipients.is_empty() {
        engine.store.ingest(
            mime,
            &Envelope {
                from: Some(ctx.user.email.clone()),
                to: recipients,
            },
        );
    }
    if save_in_sent {
        engine.store.ingest_sent(&ctx.user.email, mime);
    }
}

/// Addresses named in To/Cc/Bcc, deduplicated, request order.
fn parse_recipients(mime: &[u8]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Ok((_, imf)) = eml_codec::parse_imf(mime) else {
        return out;
    };

    let mut push_mailbox = |mbx: &eml_codec::imf::mailbox::MailboxRef| {
        let addr = format!(
            "{}@{}",
            mbx.addrspec.local_part.to_string(),
            mbx.addrspec.domain.to_string()
        );
        if !out.contains(&addr) {
            out.push(addr);
        }
    };

    use eml_codec::imf::address::AddressRef;
    for list in [&imf.to, &imf.cc, &imf.bcc] {
        for address in list {
            match address {
                AddressRef::Single(mbx) => push_mailbox(mbx),
                AddressRef::Many(group) => group.participants.iter().for_each(&mut push_mailbox),
            }
        }
    }
    out
}

fn failure(cmd: &str, log: &mut RequestLog) -> Result<CommandOutcome> {
    log.status = Some("fail".to_string());
    let page = pages::COMPOSE;
    let root = match cmd {
        "SmartForward" => Element::new(page, "SmartForward"),
        "SmartReply" => Element::new(page, "SmartReply"),
        _ => Element::new(page, "SendMail"),
    };
    // 118: mail submission failed.
    let doc = root.str("Status", "118");
    Ok(CommandOutcome::Wbxml(esta_wbxml::encode(&doc)?))
}
