//! # Command Reply
//!
//! Purpose: the logical reply shape every command executor returns. The
//! wire encoding into RESP frames lives with the transport collaborator
//! (`hkv-server`'s framing layer is treated as an external library per the
//! design's scope); this type is what crosses that boundary.

/// A command's outcome, independent of its wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`-style simple string.
    Simple(String),
    /// `-ERR ...`-style error string (no leading `-`, no trailing CRLF).
    Error(String),
    Integer(i64),
    Double(f64),
    /// `None` encodes the null bulk string (`$-1`).
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
    /// `*-1` null array, distinct from an empty array (`*0`).
    NullArray,
    /// Several independent replies written back to back on the same
    /// connection, not wrapped in their own array frame — `SUBSCRIBE k1 k2`
    /// replies with one confirmation array per channel, not one array of
    /// arrays.
    Multi(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn bulk(value: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(value.into()))
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    pub fn empty_array() -> Self {
        Reply::Array(Vec::new())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl From<crate::error::HkvError> for Reply {
    fn from(err: crate::error::HkvError) -> Self {
        Reply::Error(err.to_string())
    }
}
