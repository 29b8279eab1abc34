//! WBXML codec for the ActiveSync dialect.
//!
//! WBXML (WAP-192) is a tokenized binary serialization of XML. ActiveSync
//! extends it with a fixed set of code pages, each mapping element names to
//! one-byte tokens. This crate converts between raw WBXML bytes and a small
//! logical tree ([`Element`]/[`Node`]) that the protocol handlers operate on.
//!
//! The wire rules that matter (and that clients enforce byte by byte):
//! a four-byte header, `SWITCH_PAGE` whenever the next element lives on a
//! different code page (with a switch back before the parent's `END`),
//! `STR_I` for inline strings, `OPAQUE` for length-prefixed blobs.

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod node;
pub mod pages;

pub use decoder::{decode, decode_with, Limits};
pub use encoder::encode;
pub use error::WbxmlError;
pub use node::{Element, Node};

/// WBXML version 1.3.
pub const VERSION: u8 = 0x03;
/// "Unknown" public identifier, the only one ActiveSync uses.
pub const PUBLIC_ID: u8 = 0x01;
/// IANA MIBenum for UTF-8.
pub const CHARSET_UTF8: u8 = 0x6A;

pub const SWITCH_PAGE: u8 = 0x00;
pub const END: u8 = 0x01;
pub const ENTITY: u8 = 0x02;
pub const STR_I: u8 = 0x03;
pub const LITERAL: u8 = 0x04;
pub const OPAQUE: u8 = 0xC3;

/// Mask isolating the element identity from the content (0x40) and
/// attribute (0x80) bits.
pub const TAG_MASK: u8 = 0x3F;
pub const HAS_CONTENT: u8 = 0x40;
pub const HAS_ATTRIBUTES: u8 = 0x80;

/// Hex dump used by the DEBUG request traces: 16 bytes per line,
/// offset-prefixed.
pub fn pretty_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  {}\n", i * 16, hex::encode(chunk)));
    }
    out
}
