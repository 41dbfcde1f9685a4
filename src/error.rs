//! Error kinds shared by every collaborator in this crate.
//!
//! The state machines in [`crate::aio`] ultimately reduce every outcome to a single
//! integer result code delivered to a completion callback (mirroring the wire
//! convention of the object store this crate talks to: 0 or a positive byte count on
//! success, a negative `errno`-style code on failure). Internally we stay in
//! `Result<T, Error>` space and only collapse to the raw code at the completion
//! boundary via [`Error::to_raw`] / [`Error::from_raw`].

use thiserror::Error;

/// The four error kinds named in the design: absence, transport failure, a
/// snapshot that vanished mid-lookup, and broken invariants.
#[derive(Debug, Error, Clone)]
pub enum CloneIoError {
    /// The object does not exist. Expected and handled during guarded reads and
    /// writes; only surfaces to a caller when there genuinely is no parent to
    /// fall back to.
    #[error("object not found")]
    NotFound,

    /// Any other object-store failure (transport, permission, corruption, ...).
    #[error("object store error: {0}")]
    IoError(String),

    /// Parent-overlap lookup failed because the snapshot was deleted concurrently.
    /// Callers treat this the same as "no overlap": continue as if unparented.
    #[error("snapshot no longer exists")]
    SnapshotGone,

    /// An assertion about internal state was violated. These are bugs, not
    /// recoverable conditions; the correct response is to panic rather than limp
    /// along with corrupted state.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, CloneIoError>;

/// The raw integer result code convention used by completion callbacks: `r >= 0`
/// carries a byte count (or 0 for "no data, but success"), `r < 0` is a negated
/// `errno`-style code.
pub const ENOENT: i64 = -2;
const EIO: i64 = -5;
const ESTALE: i64 = -116;

impl CloneIoError {
    /// Collapses this error to the raw result code convention used at request
    /// completion boundaries. `Invariant` has no raw representation: it always
    /// aborts the process before reaching this point (see [`crate::aio::AioRequest`]).
    pub fn to_raw(&self) -> i64 {
        match self {
            CloneIoError::NotFound => ENOENT,
            CloneIoError::IoError(_) => EIO,
            CloneIoError::SnapshotGone => ESTALE,
            CloneIoError::Invariant(msg) => unreachable!("invariant errors must panic, not be encoded: {msg}"),
        }
    }

    /// Reconstructs an error from a raw negative result code. Used when a
    /// lower-level collaborator (e.g. a fake `ObjectStore` in tests) hands back a
    /// raw code instead of a typed error.
    pub fn from_raw(code: i64) -> Option<CloneIoError> {
        match code {
            c if c >= 0 => None,
            ENOENT => Some(CloneIoError::NotFound),
            ESTALE => Some(CloneIoError::SnapshotGone),
            _ => Some(CloneIoError::IoError(format!("object store error {code}"))),
        }
    }
}
