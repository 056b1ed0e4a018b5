//! # Error Kinds
//!
//! Purpose: Define the error surface shared by the storage engine, AOF
//! writer, cluster coordinator, and server dispatcher.
//!
//! ## Design Principles
//! 1. **One Enum, One Wire Mapping**: Every variant maps directly to one of
//!    the error kinds in the external protocol (arity, syntax, type, value,
//!    auth, unknown command, tx-abort).
//! 2. **No Panics on the Hot Path**: Executors return `HkvError` instead of
//!    unwinding; the dispatcher is the last line of panic defense.

use thiserror::Error;

/// Errors surfaced by the storage engine and its collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HkvError {
    /// Wrong number of arguments for a known command.
    #[error("wrong number of arguments for '{0}' command")]
    Arity(String),

    /// A known command received a malformed option (conflicting flags, bad LIMIT, ...).
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Operation attempted on a key holding a value of the wrong type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Numeric parse failure, non-positive expiry, or out-of-range db index.
    #[error("invalid value: {0}")]
    Value(String),

    /// Password required or incorrect.
    #[error("{0}")]
    Auth(String),

    /// Unrecognized command name.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Command is not supported while the node is running in cluster mode.
    #[error("unsupported in cluster mode: {0}")]
    ClusterUnsupported(String),

    /// EXEC aborted because of enqueue-time errors or a changed watched key.
    #[error("EXECABORT Transaction discarded because of previous errors")]
    ExecAbort,

    /// Requested key is missing (used internally by the engine, not wire-visible
    /// as its own reply kind; callers translate it to a command-specific reply).
    #[error("key not found")]
    NotFound,

    /// Generic catch-all for engine invariants that should never trip in
    /// practice; surfaced to the client as a generic error reply.
    #[error("ERR {0}")]
    Internal(String),
}

pub type HkvResult<T> = Result<T, HkvError>;
