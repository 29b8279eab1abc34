//! Settings: OOF get/set, DeviceInformation, UserInformation.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};

use esta_store::oof::{ExternalAudience, OofMessage, OofSettings, OofState};
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let Some(doc) = doc.filter(|d| d.tag == "Settings") else {
        log.status = Some("2".to_string());
        let response = Element::new(pages::SETTINGS, "Settings").str("Status", "2");
        return Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?));
    };

    let mut response = Element::new(pages::SETTINGS, "Settings").str("Status", "1");

    if let Some(oof) = doc.child("Oof") {
        if oof.has_child("Get") {
            response = response.node(oof_get_response(engine, ctx));
        } else if let Some(set) = oof.child("Set") {
            let settings = parse_oof_set(set);
            engine.oof.set(&ctx.user.email, settings)?;
            response = response.node(
                Element::new(pages::SETTINGS, "Oof").str("Status", "1"),
            );
        }
    }

    if let Some(info) = doc.child("DeviceInformation") {
        let set = info.child("Set").unwrap_or(info);
        engine.devices.update_device_info(
            &ctx.user.email,
            &ctx.device_id,
            set.child_text("Model").map(str::to_string),
            set.child_text("FriendlyName").map(str::to_string),
            set.child_text("OS").map(str::to_string),
        );
        response = response.node(
            Element::new(pages::SETTINGS, "DeviceInformation").str("Status", "1"),
        );
    }

    if doc.child("UserInformation").is_some() {
        response = response.node(
            Element::new(pages::SETTINGS, "UserInformation")
                .str("Status", "1")
                .node(
                    Element::new(pages::SETTINGS, "Get").node(
                        Element::new(pages::SETTINGS, "EmailAddresses")
                            .str("SMTPAddress", ctx.user.email.clone()),
                    ),
                ),
        );
    }

    log.status = Some("1".to_string());
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}

fn oof_get_response(engine: &Arc<EasEngine>, ctx: &RequestContext) -> Element {
    let settings = engine.oof.get(&ctx.user.email);

    let mut get = Element::new(pages::SETTINGS, "Get")
        .str("OofState", settings.state.code().to_string());
    if let Some(start) = settings.start {
        get = get.str("StartTime", format_time(start));
    }
    if let Some(end) = settings.end {
        get = get.str("EndTime", format_time(end));
    }
    get = get
        .node(oof_message(&settings.internal, "AppliesToInternal"))
        .node(oof_message(&settings.external_known, "AppliesToExternalKnown"))
        .node(oof_message(&settings.external_unknown, "AppliesToExternalUnknown"));

    Element::new(pages::SETTINGS, "Oof")
        .str("Status", "1")
        .node(get)
}

fn oof_message(message: &OofMessage, applies_to: &'static str) -> Element {
    Element::new(pages::SETTINGS, "OofMessage")
        .empty(applies_to)
        .str("Enabled", if message.enabled { "1" } else { "0" })
        .str("ReplyMessage", message.reply.clone())
        .str("BodyType", message.body_type.clone())
}

fn parse_oof_set(set: &Element) -> OofSettings {
    let mut settings = OofSettings {
        state: set
            .child_text("OofState")
            .and_then(OofState::from_code)
            .unwrap_or(OofState::Disabled),
        start: set.child_text("StartTime").and_then(parse_time),
        end: set.child_text("EndTime").and_then(parse_time),
        ..OofSettings::default()
    };

    for message in set.children_named("OofMessage") {
        let parsed = OofMessage {
            enabled: message.child_text("Enabled") == Some("1"),
            reply: message
                .child_text("ReplyMessage")
                .unwrap_or_default()
                .to_string(),
            body_type: message
                .child_text("BodyType")
                .unwrap_or("Text")
                .to_string(),
        };
        if message.has_child("AppliesToInternal") {
            settings.internal = parsed;
        } else if message.has_child("AppliesToExternalKnown") {
            settings.external_known = parsed;
        } else if message.has_child("AppliesToExternalUnknown") {
            settings.external_unknown = parsed;
        }
    }

    settings.external_audience = match (
        settings.external_unknown.enabled,
        settings.external_known.enabled,
    ) {
        (true, _) => ExternalAudience::All,
        (false, true) => ExternalAudience::Known,
        (false, false) => ExternalAudience::None,
    };

    settings
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3fZ")
        .ok()
        .map(|naive| naive.and_utc())
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

    const ALICE: &str = "alice@example.tld";

    fn engine() -> Arc<EasEngine> {
        let login = Arc::new(
            StaticLoginProvider::from_clear_entries(&[(ALICE, "hunter2")]).unwrap(),
        );
        let store = MailStore::new(ChangeBus::new());
        let engine = EasEngine::new(
            login,
            store,
            Arc::new(OofRegistry::new()),
            AutodiscoverConfig::default(),
            None,
        );
        engine.devices.upsert(ALICE, "DEV1", "iPhone", "Apple-iPhone");
        engine
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

    async fn run(engine: &Arc<EasEngine>, doc: &Element) -> Element {
        let ctx = ctx();
        let mut log = RequestLog::default();
        match handle(engine, &ctx, Some(doc), &mut log).await.unwrap() {
            CommandOutcome::Wbxml(bytes) => wbxml::decode(&bytes).unwrap(),
            _ => panic!("settings answers with wbxml"),
        }
    }

    fn oof_set_doc(state: &str, reply: &str) -> Element {
        let set = Element::new(pages::SETTINGS, "Set")
            .str("OofState", state)
            .node(
                Element::new(pages::SETTINGS, "OofMessage")
                    .empty("AppliesToInternal")
                    .str("Enabled", "1")
                    .str("ReplyMessage", reply)
                    .str("BodyType", "Text"),
            );
        Element::new(pages::SETTINGS, "Settings")
            .node(Element::new(pages::SETTINGS, "Oof").node(set))
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let engine = engine();

        let set_resp = run(&engine, &oof_set_doc("1", "gone fishing")).await;
        assert_eq!(set_resp.child_text("Status"), Some("1"));
        assert_eq!(set_resp.child("Oof").unwrap().child_text("Status"), Some("1"));

        let get_doc = Element::new(pages::SETTINGS, "Settings")
            .node(Element::new(pages::SETTINGS, "Oof").empty("Get"));
        let get_resp = run(&engine, &get_doc).await;
        let get = get_resp.child("Oof").unwrap().child("Get").unwrap();
        assert_eq!(get.child_text("OofState"), Some("1"));

        let internal = get
            .children_named("OofMessage")
            .find(|m| m.has_child("AppliesToInternal"))
            .unwrap();
        assert_eq!(internal.child_text("ReplyMessage"), Some("gone fishing"));
        assert_eq!(internal.child_text("Enabled"), Some("1"));
    }

    #[tokio::test]
    async fn device_information_is_stored() {
        let engine = engine();
        let doc = Element::new(pages::SETTINGS, "Settings").node(
            Element::new(pages::SETTINGS, "DeviceInformation").node(
                Element::new(pages::SETTINGS, "Set")
                    .str("Model", "iPhone14,2")
                    .str("FriendlyName", "Alice's iPhone")
                    .str("OS", "iOS 17.1"),
            ),
        );
        let response = run(&engine, &doc).await;
        assert_eq!(
            response.child("DeviceInformation").unwrap().child_text("Status"),
            Some("1")
        );
        let device = engine.devices.get(ALICE, "DEV1").unwrap();
        assert_eq!(device.model.as_deref(), Some("iPhone14,2"));
        assert_eq!(device.os.as_deref(), Some("iOS 17.1"));
    }

    #[tokio::test]
    async fn user_information_returns_the_address() {
        let engine = engine();
        let doc = Element::new(pages::SETTINGS, "Settings")
            .node(Element::new(pages::SETTINGS, "UserInformation").empty("Get"));
        let response = run(&engine, &doc).await;
        let smtp = response
            .child("UserInformation")
            .unwrap()
            .descendant("SMTPAddress")
            .unwrap();
        assert_eq!(smtp.text(), Some(ALICE));
    }

    #[test]
    fn time_parsing_accepts_both_shapes() {
        assert!(parse_time("2026-03-01T10:00:00.000Z").is_some());
        assert!(parse_time("2026-03-01T10:00:00+00:00").is_some());
        assert!(parse_time("not a time").is_none());
    }
}
