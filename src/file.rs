//! Byte-addressable inode I/O and the cursor-bearing handle built over it.
//!
//! The raw `read_at`/`write_at`/`set_len` functions operate directly on an
//! inode index and are shared by [`crate::directory::Directory`] (which
//! treats a directory's body as a byte stream of entries) and by
//! [`FileHandle`] (which adds a seek cursor and open-mode gating on top).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fs::{with_inner, Inner};
use crate::indirect;
use crate::util::{ceil_div, monotonic_timestamp};
use crate::OpenFlags;

/// Reads up to `buf.len()` bytes starting at `offset`, returning the number
/// actually read (short on reaching end-of-file). Updates `atime`.
pub(crate) fn read_at(inner: &mut Inner, ino: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut inode = inner.inodes.load_inode(inner.device.as_mut(), ino)?;
    if offset >= inode.size {
        return Ok(0);
    }
    let block_size = inner.config.block_size as u64;
    let to_read = buf.len().min((inode.size - offset) as usize);
    let mut done = 0usize;
    let mut block_buf = vec![0u8; block_size as usize];
    while done < to_read {
        let cur = offset + done as u64;
        let l = cur / block_size;
        let in_block = (cur % block_size) as usize;
        let chunk = (block_size as usize - in_block).min(to_read - done);
        let logical = indirect::get_for_read(inner.device.as_mut(), &inner.config, &inode.pointers, l)?;
        if logical == 0 {
            block_buf.iter_mut().take(chunk).for_each(|b| *b = 0);
        } else {
            let physical = inner.config.data_block_physical(logical);
            inner.device.read_block(physical, &mut block_buf)?;
        }
        buf[done..done + chunk].copy_from_slice(&block_buf[in_block..in_block + chunk]);
        done += chunk;
    }
    inode.atime = monotonic_timestamp(inode.atime);
    inner.inodes.store_inode(inner.device.as_mut(), ino, &inode)?;
    Ok(done)
}

/// Writes `buf` starting at `offset`, allocating and zero-filling any hole
/// between the previous end-of-file and `offset`. Extends `size` and bumps
/// `mtime`/`atime`.
pub(crate) fn write_at(inner: &mut Inner, ino: u64, offset: u64, buf: &[u8]) -> Result<usize> {
    let mut inode = inner.inodes.load_inode(inner.device.as_mut(), ino)?;
    let block_size = inner.config.block_size as u64;
    let max_bytes = indirect::max_logical_blocks(&inner.config).saturating_mul(block_size);
    let end = offset.checked_add(buf.len() as u64).ok_or(Error::FileTooLarge)?;
    if end > max_bytes {
        return Err(Error::FileTooLarge);
    }

    let mut done = 0usize;
    let mut block_buf = vec![0u8; block_size as usize];
    while done < buf.len() {
        let cur = offset + done as u64;
        let l = cur / block_size;
        let in_block = (cur % block_size) as usize;
        let chunk = (block_size as usize - in_block).min(buf.len() - done);
        let logical =
            indirect::get_for_write(inner.device.as_mut(), &inner.config, &mut inner.data_bitmap, &mut inode.pointers, l)?;
        let physical = inner.config.data_block_physical(logical);
        if chunk != block_size as usize {
            inner.device.read_block(physical, &mut block_buf)?;
        }
        block_buf[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
        inner.device.write_block(physical, &block_buf)?;
        done += chunk;
    }

    if end > inode.size {
        inode.size = end;
    }
    let now = monotonic_timestamp(inode.mtime);
    inode.mtime = now;
    inode.atime = now;
    inner.inodes.store_inode(inner.device.as_mut(), ino, &inode)?;
    Ok(done)
}

/// Grows or shrinks the inode to exactly `new_size`, freeing any block left
/// wholly beyond the new end post-order. Growing never allocates: the gap
/// reads back as zero through the existing hole semantics.
pub(crate) fn set_len(inner: &mut Inner, ino: u64, new_size: u64) -> Result<()> {
    let mut inode = inner.inodes.load_inode(inner.device.as_mut(), ino)?;
    let block_size = inner.config.block_size as u64;
    let max_bytes = indirect::max_logical_blocks(&inner.config).saturating_mul(block_size);
    if new_size > max_bytes {
        return Err(Error::FileTooLarge);
    }
    let new_block_count = ceil_div(new_size, block_size);
    indirect::truncate_from(
        inner.device.as_mut(),
        &inner.config,
        &mut inner.data_bitmap,
        &mut inode.pointers,
        new_block_count,
    )?;
    inode.size = new_size;
    inode.mtime = monotonic_timestamp(inode.mtime);
    inner.inodes.store_inode(inner.device.as_mut(), ino, &inode)?;
    Ok(())
}

/// Frees every block owned by inode `ino` and releases its table slot.
/// Callers are responsible for first removing the directory entry naming
/// it.
pub(crate) fn free_inode(inner: &mut Inner, ino: u64) -> Result<()> {
    let mut inode = inner.inodes.load_inode(inner.device.as_mut(), ino)?;
    indirect::free_all(inner.device.as_mut(), &inner.config, &mut inner.data_bitmap, &mut inode.pointers)?;
    inner.inodes.free(ino)
}

/// Reference point for [`FileHandle::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A cursor over one inode's bytes, gated by the flags it was opened with.
pub struct FileHandle {
    inner: Rc<RefCell<Inner>>,
    ino: u64,
    pos: u64,
    flags: OpenFlags,
}

impl FileHandle {
    pub(crate) fn new(inner: Rc<RefCell<Inner>>, ino: u64, flags: OpenFlags) -> Self {
        Self {
            inner,
            ino,
            pos: 0,
            flags,
        }
    }

    /// Reads into `buf` from the current cursor, advancing it by the number
    /// of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(Error::BadMode);
        }
        let pos = self.pos;
        let n = with_inner(&self.inner, |inner| read_at(inner, self.ino, pos, buf))?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Writes `buf` at the current cursor (or at end-of-file if opened with
    /// [`OpenFlags::APPEND`]), advancing the cursor by the number of bytes
    /// written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::BadMode);
        }
        let append = self.flags.contains(OpenFlags::APPEND);
        let ino = self.ino;
        let pos = if append {
            with_inner(&self.inner, |inner| {
                Ok(inner.inodes.load_inode(inner.device.as_mut(), ino)?.size)
            })?
        } else {
            self.pos
        };
        let n = with_inner(&self.inner, |inner| write_at(inner, ino, pos, buf))?;
        self.pos = pos + n as u64;
        Ok(n)
    }

    /// Repositions the cursor relative to `whence`.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let ino = self.ino;
        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos as i64,
            Whence::End => with_inner(&self.inner, |inner| {
                Ok(inner.inodes.load_inode(inner.device.as_mut(), ino)?.size as i64)
            })?,
        };
        let new_pos = base.checked_add(offset).ok_or(Error::BadOffset)?;
        if new_pos < 0 {
            return Err(Error::BadOffset);
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    /// Current cursor position.
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Grows or shrinks the file. Requires [`OpenFlags::WRITE`].
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::BadMode);
        }
        let ino = self.ino;
        with_inner(&self.inner, |inner| set_len(inner, ino, new_size))
    }

    /// Flushes the underlying device's buffered writes.
    pub fn flush(&mut self) -> Result<()> {
        with_inner(&self.inner, |inner| inner.device.flush())
    }

    /// Drops the handle. No additional per-handle resources are held
    /// beyond what [`crate::fs::Mount`] already owns.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
