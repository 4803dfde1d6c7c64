use std::str::Utf8Error;

/// Errors raised while decoding a raw BTP frame, before any ILP semantics are considered.
/// Every variant maps to an ILP `F00` at the handler's outer boundary.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short")]
    UnexpectedEof,
    #[error("unknown BTP packet type: {0}")]
    UnknownType(u8),
    #[error("expected BTP packet type {expected}, found {found}")]
    WrongType { expected: u8, found: u8 },
    #[error("malformed protocol-data sub-frame: {0}")]
    Malformed(String),
    #[error("non-UTF8 field in BTP frame: {0}")]
    InvalidUtf8(#[from] Utf8Error),
    #[error("trailing bytes after BTP frame")]
    TrailingBytes,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
