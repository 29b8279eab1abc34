//! Autodiscover: the out-of-band endpoint that tells clients where the
//! server lives and how to talk to it.
//!
//! The XML POST variant switches its whole response schema on the
//! `<AcceptableResponseSchema>` the client asks for: mobile clients want
//! the MobileSync shape, desktop Outlook the Outlook shape. The JSON GET
//! variant is what current Outlook builds try first.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::eas::{authenticate, plain_response, EasEngine};

const RESPONSE_NS: &str = "http://schemas.microsoft.com/exchange/autodiscover/responseschema/2006";
const MOBILESYNC_NS: &str =
    "http://schemas.microsoft.com/exchange/autodiscover/mobilesync/responseschema/2006";
const OUTLOOK_NS: &str =
    "http://schemas.microsoft.com/exchange/autodiscover/outlook/responseschema/2006a";

pub async fn handle_xml(
    engine: Arc<EasEngine>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let user = match authenticate(&engine, &req).await? {
        Ok(profile) => profile,
        Err(resp) => return Ok(resp),
    };

    if req.method() != hyper::Method::POST {
        return plain_response(405, "Method not allowed");
    }

    let raw = req.into_body().collect().await?.to_bytes();
    let parsed = parse_request(&raw);

    let hostname = engine.autodiscover.hostname.clone();
    let email = parsed
        .email
        .unwrap_or_else(|| user.email.clone());

    let body = match parsed.schema {
        Some(schema) if schema.contains("mobilesync") => {
            mobilesync_response(&email, user.display_name.as_deref(), &hostname)?
        }
        Some(_) => outlook_response(&email, user.display_name.as_deref(), &hostname)?,
        None => error_response(600, "Invalid Request")?,
    };

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/xml; charset=\"utf-8\"")
        .header("Cache-Control", "private, no-cache")
        .body(Full::new(Bytes::from(body)))?)
}

/// `GET /autodiscover/autodiscover.json/v1.0/{email}?Protocol=ActiveSync`
pub async fn handle_json(
    engine: Arc<EasEngine>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let path = req.uri().path().to_string();
    let (status, json) = if path.to_ascii_lowercase().contains("/v1.0/") {
        (
            200,
            serde_json::json!({
                "Protocol": "ActiveSync",
                "Url": format!("https://{}/Microsoft-Server-ActiveSync", engine.autodiscover.hostname),
            }),
        )
    } else {
        (
            404,
            serde_json::json!({
                "ErrorCode": "InvalidRequest",
                "ErrorMessage": "The given address is not a valid autodiscover v1 request",
            }),
        )
    };

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&json)?)))?)
}

#[derive(Debug, Default, PartialEq)]
struct ParsedRequest {
    email: Option<String>,
    schema: Option<String>,
}

/// Namespace-insensitive scan for the two fields we care about. Clients
/// disagree wildly about prefixes and default namespaces, so only local
/// names are matched.
fn parse_request(raw: &[u8]) -> ParsedRequest {
    let mut reader = Reader::from_reader(raw);
    reader.trim_text(true);

    let mut parsed = ParsedRequest::default();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let local = String::from_utf8_lossy(local_name(start.name().as_ref())).to_string();
                current = Some(local);
            }
            Ok(Event::Text(text)) => {
                if let (Some(tag), Ok(value)) = (current.as_deref(), text.unescape()) {
                    match tag {
                        "EMailAddress" => parsed.email = Some(value.trim().to_string()),
                        "AcceptableResponseSchema" => {
                            parsed.schema = Some(value.trim().to_string())
                        }
                        _ => (),
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => (),
        }
        buf.clear();
    }
    parsed
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|b| *b == b':') {
        Some(idx) => &qname[idx + 1..],
        None => qname,
    }
}

fn mobilesync_response(email: &str, display_name: Option<&str>, hostname: &str) -> Result<Vec<u8>> {
    let url = format!("https://{}/Microsoft-Server-ActiveSync", hostname);
    render(|w| {
        start_with_ns(w, "Autodiscover", RESPONSE_NS)?;
        start_with_ns(w, "Response", MOBILESYNC_NS)?;
        text_element(w, "Culture", "en:us")?;

        w.write_event(Event::Start(BytesStart::new("User")))?;
        text_element(w, "DisplayName", display_name.unwrap_or(email))?;
        text_element(w, "EMailAddress", email)?;
        w.write_event(Event::End(BytesEnd::new("User")))?;

        w.write_event(Event::Start(BytesStart::new("Action")))?;
        w.write_event(Event::Start(BytesStart::new("Settings")))?;
        w.write_event(Event::Start(BytesStart::new("Server")))?;
        text_element(w, "Type", "MobileSync")?;
        text_element(w, "Url", &url)?;
        text_element(w, "Name", &url)?;
        w.write_event(Event::End(BytesEnd::new("Server")))?;
        w.write_event(Event::End(BytesEnd::new("Settings")))?;
        w.write_event(Event::End(BytesEnd::new("Action")))?;

        w.write_event(Event::End(BytesEnd::new("Response")))?;
        w.write_event(Event::End(BytesEnd::new("Autodiscover")))?;
        Ok(())
    })
}

/// Desktop Outlook wants the full protocol list. `AuthPackage` stays
/// `Basic`: Negotiate looks like it works but silently fails without
/// Kerberos behind it.
fn outlook_response(email: &str, display_name: Option<&str>, hostname: &str) -> Result<Vec<u8>> {
    render(|w| {
        start_with_ns(w, "Autodiscover", RESPONSE_NS)?;
        start_with_ns(w, "Response", OUTLOOK_NS)?;

        w.write_event(Event::Start(BytesStart::new("User")))?;
        text_element(w, "DisplayName", display_name.unwrap_or(email))?;
        text_element(w, "EMailAddress", email)?;
        w.write_event(Event::End(BytesEnd::new("User")))?;

        w.write_event(Event::Start(BytesStart::new("Account")))?;
        text_element(w, "AccountType", "email")?;
        text_element(w, "Action", "settings")?;

        w.write_event(Event::Start(BytesStart::new("Protocol")))?;
        text_element(w, "Type", "EXHTTP")?;
        text_element(w, "Server", hostname)?;
        text_element(w, "SSL", "On")?;
        text_element(w, "AuthPackage", "Basic")?;
        text_element(
            w,
            "MailStore",
            &format!("https://{}/mapi/emsmdb", hostname),
        )?;
        w.write_event(Event::End(BytesEnd::new("Protocol")))?;

        w.write_event(Event::Start(BytesStart::new("Protocol")))?;
        text_element(w, "Type", "WEB")?;
        text_element(w, "Server", hostname)?;
        text_element(w, "SSL", "On")?;
        text_element(w, "AuthPackage", "Basic")?;
        text_element(w, "OWAUrl", &format!("https://{}/owa", hostname))?;
        w.write_event(Event::End(BytesEnd::new("Protocol")))?;

        w.write_event(Event::Start(BytesStart::new("Protocol")))?;
        text_element(w, "Type", "MobileSync")?;
        text_element(w, "Server", hostname)?;
        text_element(
            w,
            "Url",
            &format!("https://{}/Microsoft-Server-ActiveSync", hostname),
        )?;
        text_element(w, "AuthPackage", "Basic")?;
        w.write_event(Event::End(BytesEnd::new("Protocol")))?;

        w.write_event(Event::End(BytesEnd::new("Account")))?;
        w.write_event(Event::End(BytesEnd::new("Response")))?;
        w.write_event(Event::End(BytesEnd::new("Autodiscover")))?;
        Ok(())
    })
}

fn error_response(code: u16, message: &str) -> Result<Vec<u8>> {
    render(|w| {
        start_with_ns(w, "Autodiscover", RESPONSE_NS)?;
        w.write_event(Event::Start(BytesStart::new("Response")))?;

        let mut error = BytesStart::new("Error");
        error.push_attribute(("Time", chrono::Utc::now().format("%H:%M:%S%.3f").to_string().as_str()));
        error.push_attribute(("Id", "2477272013"));
        w.write_event(Event::Start(error))?;
        text_element(w, "ErrorCode", &code.to_string())?;
        text_element(w, "Message", message)?;
        w.write_event(Event::Empty(BytesStart::new("DebugData")))?;
        w.write_event(Event::End(BytesEnd::new("Error")))?;

        w.write_event(Event::End(BytesEnd::new("Response")))?;
        w.write_event(Event::End(BytesEnd::new("Autodiscover")))?;
        Ok(())
    })
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn render(build: impl FnOnce(&mut XmlWriter) -> Result<()>) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    build(&mut writer)?;
    Ok(writer.into_inner().into_inner())
}

fn start_with_ns(w: &mut XmlWriter, name: &str, ns: &str) -> Result<()> {
    let mut start = BytesStart::new(name);
    start.push_attribute(("xmlns", ns));
    w.write_event(Event::Start(start))?;
    Ok(())
}

fn text_element(w: &mut XmlWriter, name: &str, text: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}
