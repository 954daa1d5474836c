//! Mount/format lifecycle: the façade every other component sits behind.
//!
//! A [`Mount`] owns the block device, the data bitmap and the inode table.
//! [`Directory`] and [`crate::file::FileHandle`] handles borrow into that
//! shared state through an `Rc<RefCell<Inner>>` — the single-threaded
//! analogue of the `Arc<Mutex<_>>` a concurrent engine would use here.
//!
//! Any operation that observes [`Error::IntegrityError`] or
//! [`Error::DoubleFree`] poisons the mount: every further operation on it,
//! or on a handle borrowed from it, fails immediately with the same error
//! without touching the device again.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::bitmap::Bitmap;
use crate::block_device::{BlockDevice, FileBlockDevice, InMemoryBlockDevice};
use crate::crypto::EncryptedBlockDevice;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeTable, Mode};
pub use crate::superblock::Config;
use crate::superblock::{Superblock, SUPERBLOCK_LEN};

pub(crate) const ROOT_INODE: u64 = 1;

/// Point-in-time space usage, as reported by [`Mount::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
}

enum PoisonKind {
    Integrity,
    DoubleFree(u64),
}

pub(crate) struct Inner {
    pub(crate) device: Box<dyn BlockDevice>,
    pub(crate) config: Config,
    pub(crate) data_bitmap: Bitmap,
    pub(crate) inodes: InodeTable,
    poisoned: Option<PoisonKind>,
}

impl Inner {
    fn check_poison(&self) -> Result<()> {
        match self.poisoned {
            Some(PoisonKind::Integrity) => Err(Error::IntegrityError),
            Some(PoisonKind::DoubleFree(i)) => Err(Error::DoubleFree(i)),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: &Error) {
        let kind = match err {
            Error::IntegrityError => PoisonKind::Integrity,
            Error::DoubleFree(i) => PoisonKind::DoubleFree(*i),
            _ => return,
        };
        log::error!("mount poisoned: {err}");
        self.poisoned = Some(kind);
    }

    /// Persists both usage bitmaps, then releases the device. Called on
    /// every `Mount::close` so a subsequent mount sees every allocation made
    /// since `format`/`mount`, not just the ones present at format time.
    fn flush_and_close(&mut self) -> Result<()> {
        self.inodes.store_bitmap(self.device.as_mut(), &self.config)?;
        self.data_bitmap
            .store(self.device.as_mut(), self.config.data_bitmap_start(), self.config.data_bitmap_blocks())?;
        self.device.close()
    }
}

/// Runs `f` against the shared mount state, poisoning it if `f` returns a
/// poisoning error. Used by every [`Directory`] and [`crate::file::FileHandle`]
/// operation instead of borrowing `Inner` directly.
pub(crate) fn with_inner<T>(inner: &Rc<RefCell<Inner>>, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
    inner.borrow().check_poison()?;
    let mut guard = inner.borrow_mut();
    let result = f(&mut guard);
    if let Err(e) = &result {
        guard.poison(e);
    }
    result
}

/// An open filesystem image, returned by every `format_*`/`mount_*`
/// function.
pub struct Mount {
    inner: Rc<RefCell<Inner>>,
}

impl Mount {
    /// The root directory, always inode 1.
    pub fn root(&self) -> Directory {
        Directory::new(self.inner.clone(), ROOT_INODE)
    }

    /// Space and inode usage at this instant.
    pub fn stats(&self) -> Result<Stats> {
        with_inner(&self.inner, |inner| {
            Ok(Stats {
                total_blocks: inner.config.num_blocks,
                used_blocks: inner.data_bitmap.count_set(),
                total_inodes: inner.config.num_inodes,
                used_inodes: inner.inodes_count_set(),
            })
        })
    }

    /// Flushes the inode and data bitmaps, recomputes any integrity tag and
    /// releases the device's host-level resources (including the advisory
    /// `flock`, for file-backed mounts).
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_poison()?;
        let result = inner.flush_and_close();
        if let Err(e) = &result {
            inner.poison(e);
        }
        log::info!("mount closed");
        result
    }
}

impl Inner {
    fn inodes_count_set(&self) -> u64 {
        // the inode table's own bitmap tracks usage; exposed here rather
        // than on InodeTable so Stats stays the only place that needs it.
        self.inodes.used_count()
    }
}

fn format_common(mut device: Box<dyn BlockDevice>, config: Config) -> Result<Mount> {
    log::info!("formatting image: block_size={} num_blocks={} num_inodes={}", config.block_size, config.num_blocks, config.num_inodes);

    let sb_bytes = Superblock::new(config).to_bytes();
    let mut sb_block = vec![0u8; config.block_size as usize];
    sb_block[..sb_bytes.len()].copy_from_slice(&sb_bytes);
    device.write_block(0, &sb_block)?;

    let mut data_bitmap = Bitmap::new(config.num_blocks);
    data_bitmap.reserve(0);
    let mut inodes = InodeTable::new(&config);

    let root_inode = Inode::new(Mode::Directory);
    let root_ino = inodes.alloc(device.as_mut(), &root_inode)?;
    debug_assert_eq!(root_ino, ROOT_INODE, "root directory must land on the first non-reserved inode slot");

    inodes.store_bitmap(device.as_mut(), &config)?;
    data_bitmap.store(device.as_mut(), config.data_bitmap_start(), config.data_bitmap_blocks())?;
    device.flush()?;

    Ok(Mount {
        inner: Rc::new(RefCell::new(Inner {
            device,
            config,
            data_bitmap,
            inodes,
            poisoned: None,
        })),
    })
}

fn mount_loaded(mut device: Box<dyn BlockDevice>, config: Config) -> Result<Mount> {
    let data_bitmap = Bitmap::load(device.as_mut(), config.data_bitmap_start(), config.data_bitmap_blocks(), config.num_blocks)?;
    let inodes = InodeTable::load(device.as_mut(), &config)?;
    log::info!("mounted image: block_size={} num_blocks={} num_inodes={}", config.block_size, config.num_blocks, config.num_inodes);
    Ok(Mount {
        inner: Rc::new(RefCell::new(Inner {
            device,
            config,
            data_bitmap,
            inodes,
            poisoned: None,
        })),
    })
}

/// Formats a fresh filesystem entirely in memory, with no host-file
/// footprint.
pub fn format_in_memory(config: Config) -> Result<Mount> {
    let device = InMemoryBlockDevice::new(config.block_size, config.total_device_blocks());
    format_common(Box::new(device), config)
}

/// Formats a fresh filesystem into a host file at `path`, creating or
/// truncating it.
pub fn format_in_file(path: &Path, config: Config) -> Result<Mount> {
    let device = FileBlockDevice::create(path, config.block_size, config.total_device_blocks(), 0)?;
    format_common(Box::new(device), config)
}

/// Formats a fresh filesystem into a host file at `path`, wrapped in a
/// ChaCha20/HMAC-SHA256 encrypted envelope unlocked by `password`.
pub fn format_in_file_encrypted(path: &Path, config: Config, password: &[u8]) -> Result<Mount> {
    let device = EncryptedBlockDevice::create(path, &config, password)?;
    format_common(Box::new(device), config)
}

/// Mounts a previously-formatted in-memory image. `device`'s geometry must
/// already be known to the caller (it was built with the right
/// `block_size`); this function reads block 0 to recover everything else.
pub fn mount_in_memory(mut device: InMemoryBlockDevice) -> Result<Mount> {
    let mut block0 = vec![0u8; device.block_size() as usize];
    device.read_block(0, &mut block0)?;
    let sb = Superblock::from_bytes(&block0[..SUPERBLOCK_LEN])?;
    if sb.config.total_device_blocks() != device.num_blocks() {
        return Err(Error::FormatError);
    }
    mount_loaded(Box::new(device), sb.config)
}

/// Mounts a previously-formatted host file at `path`. The superblock (a
/// fixed-size record always smaller than the minimum block size) is read
/// as raw bytes at file offset 0 to recover the image's geometry before a
/// [`FileBlockDevice`] is constructed.
pub fn mount_in_file(path: &Path) -> Result<Mount> {
    let mut raw = vec![0u8; SUPERBLOCK_LEN];
    {
        use std::fs::File;
        use std::io::Read;
        File::open(path)?.read_exact(&mut raw)?;
    }
    let sb = Superblock::from_bytes(&raw)?;
    let device = FileBlockDevice::open(path, sb.config.block_size, sb.config.total_device_blocks(), 0)?;
    mount_loaded(Box::new(device), sb.config)
}

/// Mounts a previously-formatted encrypted host file at `path`, unlocked by
/// `password`.
pub fn mount_in_file_encrypted(path: &Path, password: &[u8]) -> Result<Mount> {
    let (sb, file_key, mac_key, base_nonce) = EncryptedBlockDevice::peek(path, password)?;
    let device = EncryptedBlockDevice::open(path, &sb.config, file_key, mac_key, base_nonce)?;
    mount_loaded(Box::new(device), sb.config)
}
