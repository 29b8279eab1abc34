use thiserror::Error;

/// Codec-boundary errors. The protocol layer maps these onto Sync
/// `Status=4` or HTTP 400 depending on where the document came from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WbxmlError {
    #[error("malformed wbxml: {0}")]
    Malformed(&'static str),

    #[error("unexpected end of document")]
    UnexpectedEof,

    #[error("unknown control token 0x{token:02x} on page {page}")]
    UnknownToken { page: u8, token: u8 },

    #[error("mismatched element nesting")]
    NestingMismatch,

    #[error("decoded content exceeds the allocation budget")]
    BudgetExceeded,

    #[error("element nesting deeper than the configured limit")]
    DepthExceeded,

    #[error("tag {tag} is not defined on code page {page}")]
    UnknownTag { page: u8, tag: &'static str },
}
