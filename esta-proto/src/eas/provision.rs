//! Provision: the two-phase MS-ASPROV handshake.
//!
//! Phase 1 downloads the policy document together with a temporary key;
//! phase 2 acknowledges that key, which promotes it to the device's
//! current policy key and opens the gate for every other command. The
//! temporary key lives in a pending slot with a ten-minute fuse and is
//! reused across phase-1 retries; issuing a fresh key per retry would
//! invalidate a phase-2 acknowledgement that is already in flight.

use std::sync::Arc;

use anyhow::Result;

use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub const POLICY_TYPE: &str = "MS-EAS-Provisioning-WBXML";

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let Some(doc) = doc.filter(|d| d.tag == "Provision") else {
        return status_response(log, 4);
    };

    // DeviceInformation may piggy-back on provisioning; accept silently.
    if let Some(info) = doc.descendant("DeviceInformation") {
        let set = info.child("Set").unwrap_or(info);
        engine.devices.update_device_info(
            &ctx.user.email,
            &ctx.device_id,
            set.child_text("Model").map(str::to_string),
            set.child_text("FriendlyName").map(str::to_string),
            set.child_text("OS").map(str::to_string),
        );
    }

    let Some(policy) = doc
        .child("Policies")
        .and_then(|p| p.child("Policy"))
    else {
        return status_response(log, 4);
    };

    if policy.child_text("PolicyType") != Some(POLICY_TYPE) {
        // 3: the policy type is one we cannot serve.
        return status_response(log, 3);
    }

    // Some clients send `PolicyKey=0` on phase 1; only a non-zero key is
    // a phase-2 acknowledgement.
    match policy.child_text("PolicyKey").filter(|k| *k != "0") {
        // Phase 2: the client echoes the temporary key.
        Some(acked) => {
            let Ok(acked) = acked.parse::<u32>() else {
                return status_response(log, 4);
            };
            match engine
                .devices
                .promote_policy_key(&ctx.user.email, &ctx.device_id, acked)
            {
                Ok(()) => {
                    log.status = Some("1".to_string());
                    let response = Element::new(pages::PROVISION, "Provision")
                        .str("Status", "1")
                        .node(
                            Element::new(pages::PROVISION, "Policies").node(
                                Element::new(pages::PROVISION, "Policy")
                                    .str("PolicyType", POLICY_TYPE)
                                    .str("Status", "1")
                                    .str("PolicyKey", acked.to_string()),
                            ),
                        );
                    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
                }
                Err(e) => {
                    tracing::debug!(err=%e, user=%ctx.user.email, device=%ctx.device_id, "phase-2 key mismatch");
                    status_response(log, 2)
                }
            }
        }
        // Phase 1: hand out the policy document and a temporary key.
        None => {
            let temp_key = engine
                .devices
                .issue_temp_policy_key(&ctx.user.email, &ctx.device_id)?;
            log.status = Some("1".to_string());
            let response = Element::new(pages::PROVISION, "Provision")
                .str("Status", "1")
                .node(
                    Element::new(pages::PROVISION, "Policies").node(
                        Element::new(pages::PROVISION, "Policy")
                            .str("PolicyType", POLICY_TYPE)
                            .str("Status", "1")
                            .str("PolicyKey", temp_key.to_string())
                            .node(policy_document()),
                    ),
                );
            Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
        }
    }
}

/// A permissive policy document: nothing is enforced on the device, the
/// handshake exists to satisfy the protocol.
fn policy_document() -> Element {
    Element::new(pages::PROVISION, "Data").node(
        Element::new(pages::PROVISION, "EASProvisionDoc")
            .str("DevicePasswordEnabled", "0")
            .str("AlphanumericDevicePasswordRequired", "0")
            .str("PasswordRecoveryEnabled", "0")
            .str("RequireStorageCardEncryption", "0")
            .str("AttachmentsEnabled", "1")
            .str("AllowSimpleDevicePassword", "1")
            .str("AllowStorageCard", "1")
            .str("AllowCamera", "1")
            .str("AllowWiFi", "1")
            .str("AllowTextMessaging", "1")
            .str("AllowPOPIMAPEmail", "1")
            .str("AllowBluetooth", "2")
            .str("AllowIrDA", "1")
            .str("RequireManualSyncWhenRoaming", "0")
            .str("AllowDesktopSync", "1")
            .str("MaxCalendarAgeFilter", "0")
            .str("AllowHTMLEmail", "1")
            .str("MaxEmailAgeFilter", "0")
            .str("AllowBrowser", "1")
            .str("AllowConsumerEmail", "1")
            .str("AllowInternetSharing", "1"),
    )
}

fn status_response(log: &mut RequestLog, status: u8) -> Result<CommandOutcome> {
    log.status = Some(status.to_string());
    let response = Element::new(pages::PROVISION, "Provision").str("Status", status.to_string());
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}

/// Body of the HTTP 449 answer on gated commands: prompts the client to
/// run the handshake.
pub fn provision_required_body() -> Result<Vec<u8>> {
    let doc = Element::new(pages::PROVISION, "Provision").str("Status", "2");
    Ok(wbxml::encode(&doc)?)
}
