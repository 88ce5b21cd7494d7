//! Operation statuses
//!
//! Every per-shard operation returns a typed status; the dispatch layer
//! converts these to wire replies. The `Display` strings of the user-facing
//! variants are part of the observable contract and must not be reworded.

use thiserror::Error;

/// Result of a storage-core operation
pub type OpResult<T> = Result<T, OpStatus>;

/// Typed operation status raised by the storage core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpStatus {
    /// Key does not exist. Many commands map this to an empty reply.
    #[error("no such key")]
    KeyNotFound,

    /// Key exists but holds a different type
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Sorted-set member not present
    #[error("could not decode requested zset member")]
    MemberNotFound,

    /// A string did not parse as the integer/float the operation required
    #[error("{0}")]
    InvalidValue(&'static str),

    /// Result would be NaN or infinite
    #[error("{0}")]
    InvalidFloat(&'static str),

    /// Signed overflow in an integer increment
    #[error("increment or decrement would overflow")]
    OutOfRange,

    /// Malformed or incompatible options
    #[error("syntax error")]
    SyntaxErr,

    /// Same as `SyntaxErr` but with a specific message
    #[error("{0}")]
    InvalidArgument(String),

    /// NX/XX/GT/LT path declined the operation; reply is null or 0
    /// depending on the command
    #[error("skipped")]
    Skipped,

    /// Allocator refused; propagated to the client
    #[error("Out of memory")]
    OutOfMemory,

    /// Replication sink back-pressure exceeded its budget
    #[error("replication stream timeout")]
    StreamTimeout,

    /// Blocking operation aborted
    #[error("operation cancelled")]
    Cancelled,

    /// Blocking operation timed out
    #[error("operation timed out")]
    TimedOut,
}

/// Error literals shared between families. Exact bytes matter.
pub mod literals {
    pub const HASH_VALUE_NOT_INT: &str = "hash value is not an integer";
    pub const HASH_VALUE_NOT_FLOAT: &str = "hash value is not a float";
    pub const INCR_NAN_INF: &str = "increment would produce NaN or Infinity";
    pub const VALUE_NOT_INT: &str = "value is not an integer or out of range";
    pub const SCORE_NAN: &str = "resulting score is not a number (NaN)";
    pub const FLOAT_RANGE: &str = "min or max is not a float";
    pub const LEX_RANGE: &str = "min or max not valid string range item";
    pub const WEIGHT_NOT_FLOAT: &str = "weight value is not a float";
    pub const UNSUPPORTED_UNIT: &str = "unsupported unit provided. please use M, KM, FT, MI";
    pub const NX_XX_INCOMPATIBLE: &str = "XX and NX options at the same time are not compatible";
    pub const GT_LT_NX_INCOMPATIBLE: &str =
        "GT, LT, and/or NX options at the same time are not compatible";
    pub const INCR_SINGLE_PAIR: &str = "INCR option supports a single increment-element pair";
    pub const STORE_WITH_INCOMPATIBLE: &str =
        "STORE option in GEORADIUS is not compatible with WITHCOORD, WITHDIST and WITHHASH options";
    pub const FLUSH_DURING_MIGRATION: &str = "FLUSH command during migration";
    pub const INVALID_CURSOR: &str = "invalid cursor";
}

impl OpStatus {
    /// Whether the status is a benign "nothing happened" outcome rather
    /// than a user-visible error
    pub fn is_benign(&self) -> bool {
        matches!(self, OpStatus::KeyNotFound | OpStatus::Skipped)
    }
}
