pub mod store;

use chrono::{DateTime, Utc};
use eml_codec::mime::r#type::Deductible;
use eml_codec::part::AnyPart;

/// Well-known folder hierarchy, shared by every user. Ids are the
/// CollectionIds clients see; type codes follow the FolderSync taxonomy.
pub struct Folder {
    pub id: &'static str,
    pub parent_id: &'static str,
    pub display_name: &'static str,
    pub type_code: u8,
    pub class: &'static str,
}

pub const FOLDERS: &[Folder] = &[
    Folder { id: "1", parent_id: "0", display_name: "Inbox", type_code: 2, class: "Email" },
    Folder { id: "2", parent_id: "0", display_name: "Drafts", type_code: 3, class: "Email" },
    Folder { id: "3", parent_id: "0", display_name: "Deleted Items", type_code: 4, class: "Email" },
    Folder { id: "4", parent_id: "0", display_name: "Sent Items", type_code: 5, class: "Email" },
    Folder { id: "5", parent_id: "0", display_name: "Outbox", type_code: 6, class: "Email" },
    Folder { id: "6", parent_id: "0", display_name: "Calendar", type_code: 8, class: "Calendar" },
    Folder { id: "7", parent_id: "0", display_name: "Contacts", type_code: 9, class: "Contacts" },
];

pub const INBOX: &str = "1";
pub const DRAFTS: &str = "2";
pub const DELETED: &str = "3";
pub const SENT: &str = "4";
pub const OUTBOX: &str = "5";

pub fn folder(id: &str) -> Option<&'static Folder> {
    FOLDERS.iter().find(|f| f.id == id)
}

/// One stored message. Immutable after ingest except `is_read` and
/// `folder_id` (soft delete / move).
#[derive(Debug, Clone)]
pub struct Email {
    pub id: u64,
    pub folder_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date_received: DateTime<Utc>,
    pub is_read: bool,
    pub message_class: String,
    pub mime: std::sync::Arc<Vec<u8>>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
}

impl Email {
    /// AirSyncBase body type of the richest representation we hold.
    pub fn native_body_type(&self) -> u8 {
        if self.body_html.is_some() {
            2
        } else {
            1
        }
    }
}

/// What MIME digestion extracts at ingest time.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedMail {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
}

/// Digest an RFC 822 message: header fields for the Sync item, decoded
/// UTF-8 plain and HTML bodies for AirSyncBase. Never fails outright;
/// an unparsable payload degrades to a bodyless record so ingest cannot
/// drop mail.
pub fn parse_mail(raw: &[u8]) -> ParsedMail {
    let message = match eml_codec::parse_message(raw) {
        Ok((_, m)) => m,
        Err(_) => {
            tracing::warn!("unparsable MIME payload, storing with raw fallback");
            return fallback_parse(raw);
        }
    };

    let imf = &message.imf;
    let mut parsed = ParsedMail {
        subject: imf
            .subject
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default(),
        from: imf
            .from
            .first()
            .map(mailbox_to_string)
            .unwrap_or_default(),
        to: address_list_to_string(&imf.to),
        date: imf.date.map(|d| d.with_timezone(&Utc)),
        body_plain: None,
        body_html: None,
    };

    collect_bodies(&message.child, &mut parsed);
    parsed
}

fn fallback_parse(raw: &[u8]) -> ParsedMail {
    let text = String::from_utf8_lossy(raw);
    let body = text
        .split_once("\r\n\r\n")
        .or_else(|| text.split_once("\n\n"))
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| text.to_string());
    ParsedMail {
        body_plain: Some(body),
        ..ParsedMail::default()
    }
}

fn mailbox_to_string(mbx: &eml_codec::imf::mailbox::MailboxRef) -> String {
    let addr = format!(
        "{}@{}",
        mbx.addrspec.local_part.to_string(),
        mbx.addrspec.domain.to_string()
    );
    match &mbx.name {
        Some(name) => format!("\"{}\" <{}>", name.to_string(), addr),
        None => addr,
    }
}

fn address_list_to_string(addrlist: &[eml_codec::imf::address::AddressRef]) -> String {
    use eml_codec::imf::address::AddressRef;
    let mut acc = vec![];
    for item in addrlist {
        match item {
            AddressRef::Single(a) => acc.push(mailbox_to_string(a)),
            AddressRef::Many(l) => acc.extend(l.participants.iter().map(mailbox_to_string)),
        }
    }
    acc.join(", ")
}

/// Walk the part tree, keeping the first text/plain and text/html leaves.
fn collect_bodies(part: &AnyPart, out: &mut ParsedMail) {
    match part {
        AnyPart::Txt(txt) => {
            let itype = match &txt.mime.interpreted_type {
                Deductible::Inferred(v) | Deductible::Explicit(v) => v,
            };
            let subtype = itype.subtype.to_string().to_ascii_lowercase();
            let charset = match &itype.charset {
                Deductible::Inferred(c) | Deductible::Explicit(c) => c.to_string(),
            };
            let decoded = decode_text(txt.body, &txt.mime.fields.transfer_encoding, &charset);
            match subtype.as_str() {
                "html" if out.body_html.is_none() => out.body_html = Some(decoded),
                "plain" if out.body_plain.is_none() => out.body_plain = Some(decoded),
                _ => (),
            }
        }
        AnyPart::Mult(multipart) => {
            for child in &multipart.children {
                collect_bodies(child, out);
            }
        }
        AnyPart::Msg(msg) => collect_bodies(&msg.child, out),
        AnyPart::Bin(_) => (),
    }
}

fn decode_text(
    body: &[u8],
    mechanism: &eml_codec::mime::mechanism::Mechanism,
    charset: &str,
) -> String {
    use eml_codec::mime::mechanism::Mechanism;

    let bytes = match mechanism {
        Mechanism::Base64 => {
            use base64::Engine;
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(&compact)
                .unwrap_or_else(|_| body.to_vec())
        }
        Mechanism::QuotedPrintable => decode_quoted_printable(body),
        _ => body.to_vec(),
    };

    to_utf8(&bytes, charset)
}

fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'=' if i + 2 < input.len() && input[i + 1] == b'\r' && input[i + 2] == b'\n' => {
                i += 3; // soft line break
            }
            b'=' if i + 1 < input.len() && input[i + 1] == b'\n' => {
                i += 2;
            }
            b'=' if i + 2 < input.len() => {
                let hi = (input[i + 1] as char).to_digit(16);
                let lo = (input[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push((h * 16 + l) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(input[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn to_utf8(bytes: &[u8], charset: &str) -> String {
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => String::from_utf8_lossy(bytes).into_owned(),
        // Single-byte charsets widen code point by code point. Windows-1252
        // differs from Latin-1 only in 0x80..0x9F, which real mail rarely
        // uses outside smart quotes; widening keeps those readable enough.
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Compose a minimal RFC 822 message, used for OOF auto-replies.
pub fn compose_plain_mail(from: &str, to: &str, subject: &str, body: &str) -> Vec<u8> {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S +0000");
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {date}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: Alice <alice@example.tld>\r\n\
To: bob@example.tld\r\n\
Subject: lunch\r\n\
Date: Mon, 6 Mar 2023 12:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
see you at noon\r\n";

    const ALTERNATIVE: &[u8] = b"From: alice@example.tld\r\n\
To: bob@example.tld\r\n\
Subject: rich\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>caf\xc3\xa9</p>\r\n\
--b1--\r\n";

    #[test]
    fn digests_a_simple_message() {
        let parsed = parse_mail(SIMPLE);
        assert_eq!(parsed.subject, "lunch");
        assert!(parsed.from.contains("alice@example.tld"));
        assert!(parsed.to.contains("bob@example.tld"));
        assert!(parsed.date.is_some());
        assert_eq!(parsed.body_plain.unwrap().trim_end(), "see you at noon");
        assert_eq!(parsed.body_html, None);
    }

    #[test]
    fn digests_multipart_alternative() {
        let parsed = parse_mail(ALTERNATIVE);
        assert!(parsed.body_plain.unwrap().starts_with("caf\u{e9}"));
        assert!(parsed.body_html.unwrap().contains("caf\u{e9}"));
    }

    #[test]
    fn quoted_printable_decoding() {
        assert_eq!(decode_quoted_printable(b"a=20b"), b"a b".to_vec());
        assert_eq!(decode_quoted_printable(b"a=\r\nb"), b"ab".to_vec());
        assert_eq!(decode_quoted_printable(b"=C3=A9"), vec![0xC3, 0xA9]);
    }

    #[test]
    fn latin1_widening() {
        assert_eq!(to_utf8(&[0x63, 0x61, 0x66, 0xE9], "iso-8859-1"), "caf\u{e9}");
    }

    #[test]
    fn unparsable_payload_degrades() {
        let parsed = parse_mail(b"\xff\xfe not mail at all");
        assert!(parsed.body_plain.is_some());
        assert_eq!(parsed.subject, "");
    }

    #[test]
    fn folder_table() {
        assert_eq!(folder(INBOX).unwrap().display_name, "Inbox");
        assert_eq!(folder(SENT).unwrap().type_code, 5);
        assert!(folder("99").is_none());
    }
}
