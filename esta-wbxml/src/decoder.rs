//! Bytes to tree.
//!
//! The decoder is the untrusted-input side of the codec: it parses client
//! requests. Two rules dominate the design. Unknown *element* tokens inside
//! known code pages are skipped wholesale (clients ship forward-compatible
//! extensions), while unknown *control* tokens abort the parse. And nothing
//! is allocated past a caller-supplied budget, so a hostile document cannot
//! balloon memory.

use crate::error::WbxmlError;
use crate::node::{Element, Node};
use crate::pages;
use crate::{END, HAS_ATTRIBUTES, HAS_CONTENT, OPAQUE, PUBLIC_ID, STR_I, SWITCH_PAGE, TAG_MASK};

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Upper bound on bytes allocated for decoded strings and blobs.
    pub max_bytes: usize,
    /// Upper bound on element nesting.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // SendMail carries whole MIME messages as one opaque blob.
            max_bytes: 16 << 20,
            max_depth: 32,
        }
    }
}

pub fn decode(input: &[u8]) -> Result<Element, WbxmlError> {
    decode_with(input, Limits::default())
}

pub fn decode_with(input: &[u8], limits: Limits) -> Result<Element, WbxmlError> {
    let mut d = Decoder {
        buf: input,
        pos: 0,
        page: 0,
        limits,
        allocated: 0,
    };
    d.header()?;

    let token = d.read_byte()?;
    let root = match d.element(token, 0)? {
        Some(el) => el,
        // A root the codec does not know is not recoverable.
        None => return Err(WbxmlError::Malformed("unknown root element")),
    };

    if d.pos != d.buf.len() {
        return Err(WbxmlError::Malformed("trailing bytes after document"));
    }
    Ok(root)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    page: u8,
    limits: Limits,
    allocated: usize,
}

impl<'a> Decoder<'a> {
    fn header(&mut self) -> Result<(), WbxmlError> {
        let version = self.read_byte()?;
        // 1.1 through 1.3; anything else is not an ActiveSync client.
        if !(0x01..=0x03).contains(&version) {
            return Err(WbxmlError::Malformed("unsupported wbxml version"));
        }
        if self.read_byte()? != PUBLIC_ID {
            return Err(WbxmlError::Malformed("unexpected public identifier"));
        }
        if self.read_byte()? != crate::CHARSET_UTF8 {
            return Err(WbxmlError::Malformed("charset is not utf-8"));
        }
        let strtbl_len = self.read_mb_u32()?;
        // ActiveSync never populates the string table.
        if strtbl_len != 0 {
            return Err(WbxmlError::Malformed("non-empty string table"));
        }
        Ok(())
    }

    /// Parse one element whose token byte has already been consumed.
    /// Returns `None` when the token is unknown on the current page; its
    /// entire subtree is consumed and dropped.
    fn element(&mut self, token: u8, depth: usize) -> Result<Option<Element>, WbxmlError> {
        if depth >= self.limits.max_depth {
            return Err(WbxmlError::DepthExceeded);
        }
        if token & HAS_ATTRIBUTES != 0 {
            return Err(WbxmlError::Malformed("attributes are not used by activesync"));
        }
        if token == END {
            return Err(WbxmlError::NestingMismatch);
        }

        let has_content = token & HAS_CONTENT != 0;
        let page = self.page;
        match pages::tag_of(page, token & TAG_MASK) {
            Some(tag) => {
                let mut el = Element::new(page, tag);
                if has_content {
                    self.content(&mut el, depth)?;
                }
                Ok(Some(el))
            }
            None => {
                if has_content {
                    self.skip_content(depth)?;
                }
                Ok(None)
            }
        }
    }

    fn content(&mut self, el: &mut Element, depth: usize) -> Result<(), WbxmlError> {
        loop {
            match self.read_byte()? {
                END => return Ok(()),
                SWITCH_PAGE => {
                    self.page = self.read_byte()?;
                }
                STR_I => {
                    let s = self.read_str_i()?;
                    el.children.push(Node::Text(s));
                }
                OPAQUE => {
                    let b = self.read_opaque()?;
                    el.children.push(Node::Opaque(b));
                }
                tok if tok & TAG_MASK >= 0x05 => {
                    if let Some(child) = self.element(tok, depth + 1)? {
                        el.children.push(Node::Elem(child));
                    }
                }
                tok => {
                    return Err(WbxmlError::UnknownToken {
                        page: self.page,
                        token: tok,
                    })
                }
            }
        }
    }

    /// Consume the subtree of an element whose tag the page table does not
    /// know. Page switches inside still apply globally.
    fn skip_content(&mut self, depth: usize) -> Result<(), WbxmlError> {
        if depth >= self.limits.max_depth {
            return Err(WbxmlError::DepthExceeded);
        }
        loop {
            match self.read_byte()? {
                END => return Ok(()),
                SWITCH_PAGE => {
                    self.page = self.read_byte()?;
                }
                STR_I => {
                    self.skip_str_i()?;
                }
                OPAQUE => {
                    let len = self.read_mb_u32()? as usize;
                    self.advance(len)?;
                }
                tok if tok & HAS_ATTRIBUTES != 0 => {
                    return Err(WbxmlError::Malformed("attributes are not used by activesync"));
                }
                tok if tok & TAG_MASK >= 0x05 => {
                    if tok & HAS_CONTENT != 0 {
                        self.skip_content(depth + 1)?;
                    }
                }
                tok => {
                    return Err(WbxmlError::UnknownToken {
                        page: self.page,
                        token: tok,
                    })
                }
            }
        }
    }

    // ---- primitive readers

    fn read_byte(&mut self) -> Result<u8, WbxmlError> {
        let b = *self.buf.get(self.pos).ok_or(WbxmlError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn advance(&mut self, n: usize) -> Result<&'a [u8], WbxmlError> {
        let end = self.pos.checked_add(n).ok_or(WbxmlError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(WbxmlError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_mb_u32(&mut self) -> Result<u32, WbxmlError> {
        let mut value: u32 = 0;
        for _ in 0..5 {
            let b = self.read_byte()?;
            value = value
                .checked_shl(7)
                .ok_or(WbxmlError::Malformed("mb-u32 overflow"))?
                | u32::from(b & 0x7F);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WbxmlError::Malformed("mb-u32 longer than five bytes"))
    }

    fn read_str_i(&mut self) -> Result<String, WbxmlError> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|b| *b == 0x00)
            .ok_or(WbxmlError::UnexpectedEof)?;
        let raw = &self.buf[start..start + nul];
        self.pos = start + nul + 1;
        self.budget(raw.len())?;
        String::from_utf8(raw.to_vec()).map_err(|_| WbxmlError::Malformed("invalid utf-8 string"))
    }

    fn skip_str_i(&mut self) -> Result<(), WbxmlError> {
        let nul = self.buf[self.pos..]
            .iter()
            .position(|b| *b == 0x00)
            .ok_or(WbxmlError::UnexpectedEof)?;
        self.pos += nul + 1;
        Ok(())
    }

    fn read_opaque(&mut self) -> Result<Vec<u8>, WbxmlError> {
        let len = self.read_mb_u32()? as usize;
        self.budget(len)?;
        Ok(self.advance(len)?.to_vec())
    }

    fn budget(&mut self, n: usize) -> Result<(), WbxmlError> {
        self.allocated = self
            .allocated
            .checked_add(n)
            .ok_or(WbxmlError::BudgetExceeded)?;
        if self.allocated > self.limits.max_bytes {
            return Err(WbxmlError::BudgetExceeded);
        }
        Ok(())
    }
}
