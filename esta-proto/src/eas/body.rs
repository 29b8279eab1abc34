//! Body selection and truncation for Sync and ItemOperations.

use esta_store::mail::Email;

use crate::eas::strategy::ClientStrategy;

/// One `<BodyPreference>` from the client, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPreference {
    pub body_type: u8,
    pub truncation_size: Option<u32>,
    pub all_or_none: bool,
}

/// What goes into `<Body>`: already truncated, plus the numbers the
/// envelope elements need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedBody {
    pub body_type: u8,
    pub data: Vec<u8>,
    /// Byte count of the full body as stored, not of `data`.
    pub estimated_size: usize,
    pub truncated: bool,
}

/// Pick the body representation: first client preference the server can
/// satisfy, else the dialect's own order. Type 4 (raw MIME) is always
/// servable; 1 and 2 fall back to the other text representation when the
/// message only carries one.
pub fn select_body(
    email: &Email,
    prefs: &[BodyPreference],
    strategy: &ClientStrategy,
    is_initial_sync: bool,
) -> SelectedBody {
    let chosen = prefs
        .iter()
        .find(|p| servable(email, p.body_type))
        .cloned()
        .or_else(|| {
            strategy
                .body_preference_order
                .iter()
                .find(|t| servable(email, **t))
                .map(|t| BodyPreference {
                    body_type: *t,
                    truncation_size: None,
                    all_or_none: false,
                })
        })
        .unwrap_or(BodyPreference {
            body_type: 1,
            truncation_size: None,
            all_or_none: false,
        });

    let bound = strategy.effective_truncation(
        chosen.body_type,
        chosen.truncation_size,
        is_initial_sync,
    );

    match chosen.body_type {
        4 => {
            let full: &[u8] = email.mime.as_ref();
            let cap = bound.map(|b| b as usize).unwrap_or(full.len());
            let cut = cap.min(full.len());
            SelectedBody {
                body_type: 4,
                data: full[..cut].to_vec(),
                estimated_size: full.len(),
                truncated: cut < full.len(),
            }
        }
        t => {
            let full = text_for(email, t);
            let cut = match bound {
                Some(b) => truncate_utf8(&full, b as usize),
                None => full.as_str(),
            };
            SelectedBody {
                body_type: t,
                data: cut.as_bytes().to_vec(),
                estimated_size: full.len(),
                truncated: cut.len() < full.len(),
            }
        }
    }
}

fn servable(email: &Email, body_type: u8) -> bool {
    match body_type {
        1 => email.body_plain.is_some() || email.body_html.is_some(),
        2 => email.body_html.is_some() || email.body_plain.is_some(),
        4 => true,
        _ => false,
    }
}

/// The UTF-8 text served for Type 1 or 2, deriving one representation
/// from the other when necessary.
fn text_for(email: &Email, body_type: u8) -> String {
    match body_type {
        2 => match (&email.body_html, &email.body_plain) {
            (Some(html), _) => html.clone(),
            (None, Some(plain)) => format!("<html><body><pre>{}</pre></body></html>", plain),
            (None, None) => String::new(),
        },
        _ => match (&email.body_plain, &email.body_html) {
            (Some(plain), _) => plain.clone(),
            (None, Some(html)) => strip_tags(html),
            (None, None) => String::new(),
        },
    }
}

/// Crude tag stripper for messages that only ship HTML.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => (),
        }
    }
    out
}

/// Cut at `cap` bytes, backing off to the previous code-point boundary.
/// A split multi-byte sequence is a fatal decode error on clients.
pub fn truncate_utf8(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
