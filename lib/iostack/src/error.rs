//! Error taxonomy shared by every layer in the stack.
//!
//! OS errors pass an `errno` through unmolested, while alignment violations,
//! holes, and integrity failures are reported under
//! [`StackError::Logic`] / [`StackError::Corruption`], which the facade
//! escalates to a fatal condition instead of returning to the caller.

use std::io;

use snafu::Snafu;

/// Result type returned by every [`crate::layer::Layer`] operation.
pub type StackResult<T> = Result<T, StackError>;

/// Sentinel non-OS error code marking a logic/invariant violation, returned
/// by [`StackError::code`] in place of an `errno` for `Logic`/`Corruption`/
/// `RecordTooLarge` errors.
pub const E_IOSTACK: i32 = -1;

/// Sticky per-layer error state.
///
/// A layer's header stores the most recent `StackError` it has seen,
/// separately from the `eof` flag (EOF is not an error, see
/// [`crate::layer::Layer::eof`]).
#[derive(Debug, Snafu)]
pub enum StackError {
    /// A pass-through OS-level failure from `open`/`read`/`write`/`sync`/`truncate`/`fallocate`.
    #[snafu(display("I/O error: {source}"))]
    Io { source: io::Error },

    /// An alignment or invariant violation: unaligned offsets, holes, a
    /// write to a non-last compressed block, or an impossible layer
    /// configuration (cipher key size mismatch, incompatible block sizes).
    ///
    #[snafu(display("I/O stack logic error: {message}"))]
    Logic { message: String },

    /// An integrity failure: an AEAD tag mismatch, or a corrupted LZ4
    /// trailer/index detected while opening.
    ///
    /// Kept as a distinct variant so callers (and tests) can tell "this
    /// stack is misconfigured" apart
    /// from "this file's ciphertext has been tampered with or truncated".
    #[snafu(display("integrity check failed: {message}"))]
    Corruption { message: String },

    /// A length-prefixed record (`read_sized`/`write_sized`) exceeded the
    /// maximum record size of 16 MiB.
    #[snafu(display("record of {actual} bytes exceeds the {limit} byte limit"))]
    RecordTooLarge { limit: usize, actual: usize },
}

impl From<io::Error> for StackError {
    fn from(source: io::Error) -> Self {
        StackError::Io { source }
    }
}

impl StackError {
    pub fn logic(message: impl Into<String>) -> Self {
        StackError::Logic {
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        StackError::Corruption {
            message: message.into(),
        }
    }

    /// True for a logic or integrity error rather than a plain OS error.
    /// The facade turns these into a fatal
    /// condition instead of returning them to the caller.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, StackError::Logic { .. } | StackError::Corruption { .. })
    }

    /// The platform `errno`, when this error passed through from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            StackError::Io { source } => source.raw_os_error(),
            _ => None,
        }
    }

    /// The sticky `err_code`: the platform `errno` for a pass-through OS
    /// error, or the [`E_IOSTACK`] sentinel for a logic/corruption error.
    /// Mirrors the spec's `err_code` + `err_msg` pair, with `err_msg`
    /// available via `Display`.
    pub fn code(&self) -> i32 {
        self.raw_os_error().unwrap_or(E_IOSTACK)
    }

    /// `io::Error` carries a source that isn't `Clone`, but a layer's sticky
    /// error needs to be retrievable more than once even from a closed or
    /// invalid descriptor. This reconstructs an equivalent error: OS errors
    /// round-trip through `errno`, logic and
    /// corruption errors just clone their message.
    pub fn duplicate(&self) -> StackError {
        match self {
            StackError::Io { source } => match source.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code).into(),
                None => StackError::logic(source.to_string()),
            },
            StackError::Logic { message } => StackError::logic(message.clone()),
            StackError::Corruption { message } => StackError::corruption(message.clone()),
            StackError::RecordTooLarge { limit, actual } => StackError::RecordTooLarge {
                limit: *limit,
                actual: *actual,
            },
        }
    }
}
