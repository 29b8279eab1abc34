//! Tree to bytes.

use crate::error::WbxmlError;
use crate::node::{Element, Node};
use crate::pages;
use crate::{
    CHARSET_UTF8, END, HAS_CONTENT, OPAQUE, PUBLIC_ID, STR_I, SWITCH_PAGE, VERSION,
};

/// Serialize a document. The emitted bytes always follow the switch-back
/// discipline: whenever a child on a foreign page closes, the encoder
/// returns to the parent's page before writing the parent's `END`, so a
/// decoder's notion of "current page" is unambiguous at every nesting
/// level.
pub fn encode(root: &Element) -> Result<Vec<u8>, WbxmlError> {
    let mut out = vec![VERSION, PUBLIC_ID, CHARSET_UTF8, 0x00];
    let mut current_page: u8 = 0;
    encode_element(root, &mut out, &mut current_page)?;
    Ok(out)
}

fn encode_element(el: &Element, out: &mut Vec<u8>, current_page: &mut u8) -> Result<(), WbxmlError> {
    if el.page != *current_page {
        out.push(SWITCH_PAGE);
        out.push(el.page);
        *current_page = el.page;
    }

    let token = pages::token_of(el.page, el.tag).ok_or(WbxmlError::UnknownTag {
        page: el.page,
        tag: el.tag,
    })?;

    if el.children.is_empty() {
        out.push(token);
        return Ok(());
    }

    out.push(token | HAS_CONTENT);
    for child in &el.children {
        match child {
            Node::Elem(e) => encode_element(e, out, current_page)?,
            Node::Text(s) => {
                out.push(STR_I);
                out.extend_from_slice(s.as_bytes());
                out.push(0x00);
            }
            Node::Opaque(b) => {
                out.push(OPAQUE);
                write_mb_u32(out, b.len() as u32);
                out.extend_from_slice(b);
            }
        }
    }

    if *current_page != el.page {
        out.push(SWITCH_PAGE);
        out.push(el.page);
        *current_page = el.page;
    }
    out.push(END);
    Ok(())
}

/// WBXML multi-byte unsigned integer: big-endian 7-bit groups, high bit
/// set on every byte but the last.
pub fn write_mb_u32(out: &mut Vec<u8>, mut value: u32) {
    let mut stack = [0u8; 5];
    let mut n = 0;
    loop {
        stack[n] = (value & 0x7F) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.push(stack[n] | 0x80);
    }
    out.push(stack[0]);
}
