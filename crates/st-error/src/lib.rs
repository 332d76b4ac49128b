#![forbid(unsafe_code)]
//! Error types for synctrack.
//!
//! # Error Taxonomy
//!
//! synctrack uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Decoding | `DecodeError` | `st-journal` | Activity-log transaction records that fail magic or checksum validation |
//! | Runtime | `StError` | `st-error` (this crate) | Errors returned by the device context, bitmap and I/O engines |
//!
//! `DecodeError` converts into `StError::Corruption` at the `st-journal`
//! boundary, carrying the sector of the offending ring slot.
//!
//! ## Failure Classes
//!
//! | Class | Variants | Caller reaction |
//! |-------|----------|-----------------|
//! | Transient | `TryAgain`, `Starving` | Wait for a slot or an extent to drain, then retry |
//! | Interrupted | `Interrupted` | Abort the waiting operation; nothing was pinned |
//! | Integrity | `Corruption`, `Inconsistency` | Discard the record or force a disconnect; never a crash |
//! | Backing store | `Io`, `MetaIo`, `Diskless` | Escalated through the disk-error path; local I/O refused once diskless |
//! | Configuration | `Format`, `InvalidGeometry`, `NoSpace` | Refuse to attach |
//!
//! ## errno Mapping
//!
//! Every `StError` variant maps to exactly one POSIX errno via
//! [`StError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `MetaIo` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Inconsistency` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `TryAgain` | `EAGAIN` |
//! | `Starving` | `EAGAIN` |
//! | `Interrupted` | `EINTR` |
//! | `Diskless` | `ENODEV` |

use thiserror::Error;

/// Unified error type for all synctrack operations.
#[derive(Debug, Error)]
pub enum StError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata read or write failed at a known sector.
    ///
    /// Raised by activity-log transaction I/O and bitmap page I/O after the
    /// failure has been reported to the disk-error path.
    #[error("metadata I/O failed at sector {sector}: {detail}")]
    MetaIo { sector: u64, detail: String },

    /// On-disk metadata failed validation at a known sector.
    #[error("corrupt metadata at sector {sector}: {detail}")]
    Corruption { sector: u64, detail: String },

    /// In-memory bookkeeping contradicts itself (e.g. `rs_failed > rs_left`).
    ///
    /// Never expected; indicates a logic error in a caller.
    #[error("inconsistent state: {0}")]
    Inconsistency(String),

    /// The metadata area does not hold a recognizable layout.
    #[error("invalid metadata format: {0}")]
    Format(String),

    /// Configuration or metadata layout is numerically impossible.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The reserved bitmap area is too small for the requested capacity.
    #[error("no space left in metadata area")]
    NoSpace,

    /// Admission was refused; the caller should retry later.
    #[error("resource busy, try again")]
    TryAgain,

    /// Every cache slot is pinned; the caller must wait for a release.
    #[error("cache starving: no unpinned slot")]
    Starving,

    /// A blocking wait was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// The local disk is detached or failed; local I/O is refused.
    #[error("no usable local disk")]
    Diskless,
}

impl StError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::MetaIo { .. } | Self::Corruption { .. } | Self::Inconsistency(_) => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::TryAgain | Self::Starving => libc::EAGAIN,
            Self::Interrupted => libc::EINTR,
            Self::Diskless => libc::ENODEV,
        }
    }

    /// Whether retrying the same call later can succeed without outside help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TryAgain | Self::Starving)
    }

    /// Whether the failure involves the backing metadata device.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Io(_) | Self::MetaIo { .. } | Self::Diskless)
    }
}

/// Result alias using `StError`.
pub type Result<T> = std::result::Result<T, StError>;
