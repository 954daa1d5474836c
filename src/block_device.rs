//! Block-device backends: the capability set every higher layer is built on.
//!
//! Modeled as a trait rather than an enum so the façade in [`crate::fs`] can
//! hold a `Box<dyn BlockDevice>` regardless of whether the bytes live in a
//! `Vec`, a host file, or (wrapped one layer up, see [`crate::crypto`]) an
//! encrypted host file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Error, Result};

/// Read/write/flush/close over fixed-size blocks, addressed by index.
pub trait BlockDevice {
    /// Reads block `n` into `buf`. `buf.len()` must equal [`Self::block_size`].
    fn read_block(&mut self, n: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to block `n`. `buf.len()` must equal [`Self::block_size`].
    fn write_block(&mut self, n: u64, buf: &[u8]) -> Result<()>;

    /// Flushes any buffered writes to the backing storage.
    fn flush(&mut self) -> Result<()>;

    /// Releases any host-level resources (locks, file descriptors) held by
    /// this device. Implies [`Self::flush`].
    fn close(&mut self) -> Result<()>;

    /// The fixed size, in bytes, of every block.
    fn block_size(&self) -> u32;

    /// The total number of addressable blocks.
    fn num_blocks(&self) -> u64;

    /// Validates `n` and `buf` against this device's geometry.
    fn check(&self, n: u64, buf_len: usize) -> Result<()> {
        if n >= self.num_blocks() {
            return Err(Error::OutOfRange);
        }
        if buf_len != self.block_size() as usize {
            return Err(Error::BadSize);
        }
        Ok(())
    }
}

/// A block device backed by a plain in-memory buffer. Used for tests and for
/// callers that want a scratch filesystem with no host-file footprint.
pub struct InMemoryBlockDevice {
    block_size: u32,
    blocks: Vec<Box<[u8]>>,
}

impl InMemoryBlockDevice {
    /// Creates a device of `num_blocks` zeroed blocks of `block_size` bytes
    /// each.
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        let blocks = (0..num_blocks)
            .map(|_| vec![0u8; block_size as usize].into_boxed_slice())
            .collect();
        Self { block_size, blocks }
    }
}

impl BlockDevice for InMemoryBlockDevice {
    fn read_block(&mut self, n: u64, buf: &mut [u8]) -> Result<()> {
        self.check(n, buf.len())?;
        buf.copy_from_slice(&self.blocks[n as usize]);
        Ok(())
    }

    fn write_block(&mut self, n: u64, buf: &[u8]) -> Result<()> {
        self.check(n, buf.len())?;
        self.blocks[n as usize].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }
}

/// A block device backed by a host file, with an advisory exclusive
/// `flock(2)` held for the lifetime of the device so a second process (or a
/// second call in this one) cannot mount the same file concurrently.
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    num_blocks: u64,
    /// Byte offset of block 0 from the start of the host file. Nonzero when
    /// wrapped by an encrypted header (see [`crate::crypto`]).
    header_size: u64,
    locked: bool,
}

impl FileBlockDevice {
    /// Creates a new host file of the given geometry, truncating any
    /// existing content, and locks it.
    pub fn create(path: &Path, block_size: u32, num_blocks: u64, header_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(header_size + block_size as u64 * num_blocks)?;
        let mut dev = Self {
            file,
            block_size,
            num_blocks,
            header_size,
            locked: false,
        };
        dev.lock()?;
        Ok(dev)
    }

    /// Opens an existing host file with the given geometry and locks it.
    pub fn open(path: &Path, block_size: u32, num_blocks: u64, header_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut dev = Self {
            file,
            block_size,
            num_blocks,
            header_size,
            locked: false,
        };
        dev.lock()?;
        Ok(dev)
    }

    /// Reads raw header bytes (everything before block 0).
    pub fn read_header(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes raw header bytes (everything before block 0).
    pub fn write_header(&mut self, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::AlreadyMounted);
            }
            return Err(Error::IoError(err));
        }
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) {
        if self.locked {
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
            self.locked = false;
        }
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&mut self, n: u64, buf: &mut [u8]) -> Result<()> {
        self.check(n, buf.len())?;
        let off = self.header_size + n * self.block_size as u64;
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, n: u64, buf: &[u8]) -> Result<()> {
        self.check(n, buf.len())?;
        let off = self.header_size + n * self.block_size as u64;
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.unlock();
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        self.unlock();
    }
}
