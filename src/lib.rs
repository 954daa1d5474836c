//! A user-level virtual filesystem.
//!
//! Emulates a classic UNIX on-disk layout — superblock, allocation bitmaps,
//! inode table, data blocks and multi-level indirect pointers — on top of a
//! pluggable block-storage backend. The backend may live entirely in memory,
//! on a host file, or on a host file wrapped in a ChaCha20/HMAC-SHA256
//! encrypted envelope.
//!
//! Concurrency model is single-threaded cooperative: see [`fs::Mount`] for
//! the mount lifecycle and [`error::Error::AlreadyMounted`] for the
//! host-level contention guard.

mod bitmap;
mod block_device;
mod crc32;
mod crypto;
mod directory;
mod error;
mod file;
mod fs;
mod indirect;
mod inode;
mod superblock;
mod util;

pub use block_device::{BlockDevice, FileBlockDevice, InMemoryBlockDevice};
pub use directory::{Directory, OpenFlags};
pub use error::{Error, Result};
pub use file::{FileHandle, Whence};
pub use fs::{
    format_in_file, format_in_file_encrypted, format_in_memory, mount_in_file, mount_in_file_encrypted,
    mount_in_memory, Config, Mount, Stats,
};
pub use inode::Mode;
