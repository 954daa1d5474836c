//! Error kinds surfaced by the engine.
//!
//! Every operation in this crate returns [`Result`]. Two kinds —
//! [`Error::IntegrityError`] and [`Error::DoubleFree`] — are unrecoverable:
//! once observed, the owning [`crate::fs::Mount`] is poisoned and every
//! further operation fails with the same kind (see `fs::Mount::poison`).

use std::io;

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong talking to or through the filesystem engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Superblock magic or layout is not recognized.
    #[error("not a recognized filesystem image")]
    FormatError,
    /// Superblock format version is not supported by this build.
    #[error("unsupported filesystem version")]
    VersionError,
    /// The password supplied to an encrypted mount does not match the one
    /// used at format time.
    #[error("wrong password")]
    AuthError,
    /// The whole-disk MAC did not verify; the backing storage was tampered
    /// with (or corrupted) after the last clean close.
    #[error("integrity check failed, filesystem image may be corrupt or tampered with")]
    IntegrityError,
    /// A bitmap allocator has no free index left.
    #[error("no space left on device")]
    NoSpace,
    /// A logical block index exceeds the addressable ceiling for the
    /// configured geometry.
    #[error("file too large for this filesystem's geometry")]
    FileTooLarge,
    /// No entry by that name exists in the directory.
    #[error("no such file or directory")]
    NotFound,
    /// An entry by that name already exists.
    #[error("file exists")]
    Exists,
    /// Operation expected a regular file but got a directory.
    #[error("is a directory")]
    IsDir,
    /// Operation expected a directory but got a regular file.
    #[error("not a directory")]
    NotDir,
    /// Directory removal or overwrite target is a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
    /// A rename would move a directory into its own descendant.
    #[error("cannot move a directory into its own subtree")]
    Loop,
    /// A path component is empty, contains `/` or NUL, or is too long.
    #[error("invalid name")]
    InvalidName,
    /// The operation is not permitted by the handle's open mode.
    #[error("operation not permitted in this mode")]
    BadMode,
    /// A seek or range argument is out of the representable domain.
    #[error("invalid offset")]
    BadOffset,
    /// A buffer handed to the block device is not exactly `block_size`.
    #[error("buffer size does not match block size")]
    BadSize,
    /// A block or inode index is beyond the configured geometry.
    #[error("index out of range")]
    OutOfRange,
    /// The allocator was asked to free an index that is already free.
    #[error("double free of block or inode {0}")]
    DoubleFree(u64),
    /// A second mount of the same host-backed device was attempted while one
    /// was already open.
    #[error("device is already mounted")]
    AlreadyMounted,
    /// The underlying host device failed.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl Error {
    /// Whether observing this error should poison the owning mount.
    pub(crate) fn poisons(&self) -> bool {
        matches!(self, Error::IntegrityError | Error::DoubleFree(_))
    }
}
