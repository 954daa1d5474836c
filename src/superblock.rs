//! Filesystem geometry ([`Config`]) and its persisted form ([`Superblock`]).
//!
//! The superblock is read before anything else is known about the image, so
//! its on-disk form is a small fixed-size record placed at a fixed byte
//! offset, independent of the configured `block_size` — mirroring how the
//! ext2 layout this engine is modeled on keeps its superblock at a fixed
//! offset regardless of block size.

use crate::crc32;
use crate::error::{Error, Result};
use crate::util::ceil_div;

/// Minimum allowed block size (inclusive), matching §3 of the design.
pub const MIN_BLOCK_SIZE: u32 = 64;
/// Number of direct pointers carried in every inode.
pub const DIRECT_POINTERS: usize = 12;
/// Byte width of one on-disk block pointer.
pub const POINTER_WIDTH: u64 = 4;
/// Fixed on-disk size of one [`Superblock`] record.
pub const SUPERBLOCK_LEN: usize = 34;

const MAGIC: [u8; 4] = *b"UFS1";
const VERSION: u16 = 1;

/// Immutable-after-format filesystem geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub block_size: u32,
    pub inode_size: u32,
    /// Number of data blocks addressable by inode pointers. Index 0 within
    /// this range is reserved and never allocated.
    pub num_blocks: u64,
    /// Number of inode slots. Index 0 is reserved; index 1 is the root.
    pub num_inodes: u64,
}

impl Config {
    /// Minimum on-disk inode record size: the fixed header plus 15 pointers.
    pub const MIN_INODE_SIZE: u32 = 2 + 2 + 8 + 8 + 8 + 15 * 4;

    /// Validates and builds a geometry.
    pub fn new(block_size: u32, inode_size: u32, num_blocks: u64, num_inodes: u64) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(Error::BadSize);
        }
        if inode_size < Self::MIN_INODE_SIZE {
            return Err(Error::BadSize);
        }
        if num_blocks < 2 {
            // index 0 is reserved; at least one usable data block is required.
            return Err(Error::OutOfRange);
        }
        if num_inodes < 2 {
            // index 0 is reserved; the root directory needs index 1.
            return Err(Error::OutOfRange);
        }
        Ok(Self {
            block_size,
            inode_size,
            num_blocks,
            num_inodes,
        })
    }

    /// Pointers per indirect block (`N` in the design doc).
    pub fn pointers_per_block(&self) -> u64 {
        self.block_size as u64 / POINTER_WIDTH
    }

    /// The addressable file size ceiling, in bytes:
    /// `(12 + N + N^2 + N^3) * block_size`.
    pub fn max_file_size(&self) -> u64 {
        let n = self.pointers_per_block() as u128;
        let blocks = DIRECT_POINTERS as u128 + n + n * n + n * n * n;
        blocks
            .saturating_mul(self.block_size as u128)
            .min(u64::MAX as u128) as u64
    }

    /// Number of blocks occupied by the inode-usage bitmap.
    pub fn inode_bitmap_blocks(&self) -> u64 {
        ceil_div(ceil_div(self.num_inodes, 8), self.block_size as u64)
    }

    /// Number of blocks occupied by the data-block-usage bitmap.
    pub fn data_bitmap_blocks(&self) -> u64 {
        ceil_div(ceil_div(self.num_blocks, 8), self.block_size as u64)
    }

    /// Number of blocks occupied by the inode table.
    pub fn inode_table_blocks(&self) -> u64 {
        ceil_div(self.num_inodes * self.inode_size as u64, self.block_size as u64)
    }

    /// Physical block number where the inode bitmap begins.
    pub fn inode_bitmap_start(&self) -> u64 {
        1 // block 0 is the superblock
    }

    /// Physical block number where the data bitmap begins.
    pub fn data_bitmap_start(&self) -> u64 {
        self.inode_bitmap_start() + self.inode_bitmap_blocks()
    }

    /// Physical block number where the inode table begins.
    pub fn inode_table_start(&self) -> u64 {
        self.data_bitmap_start() + self.data_bitmap_blocks()
    }

    /// Physical block number of data-block index 0 (reserved, never used).
    pub fn data_start(&self) -> u64 {
        self.inode_table_start() + self.inode_table_blocks()
    }

    /// Maps a logical data-block index (nonzero) to its physical block
    /// number on the plain-layout device.
    pub fn data_block_physical(&self, logical: u32) -> u64 {
        self.data_start() + logical as u64
    }

    /// Total number of physical blocks the plain layout occupies, including
    /// the superblock, both bitmaps, the inode table and the data region.
    pub fn total_device_blocks(&self) -> u64 {
        self.data_start() + self.num_blocks
    }
}

/// The persisted geometry + format identity living at block 0.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub config: Config,
}

impl Superblock {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Serializes this superblock into its fixed-size on-disk form.
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_LEN] {
        let mut buf = [0u8; SUPERBLOCK_LEN];
        let mut off = 0;
        macro_rules! put {
            ($bytes:expr) => {{
                let b = $bytes;
                buf[off..off + b.len()].copy_from_slice(&b);
                off += b.len();
            }};
        }
        put!(MAGIC);
        put!(VERSION.to_le_bytes());
        put!(self.config.block_size.to_le_bytes());
        put!(self.config.inode_size.to_le_bytes());
        put!(self.config.num_blocks.to_le_bytes());
        put!(self.config.num_inodes.to_le_bytes());
        let crc = crc32::compute(&buf[..off]);
        put!(crc.to_le_bytes());
        buf
    }

    /// Parses a superblock from its fixed-size on-disk form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_LEN {
            return Err(Error::FormatError);
        }
        if buf[0..4] != MAGIC {
            return Err(Error::FormatError);
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::VersionError);
        }
        let block_size = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        let inode_size = u32::from_le_bytes(buf[10..14].try_into().unwrap());
        let num_blocks = u64::from_le_bytes(buf[14..22].try_into().unwrap());
        let num_inodes = u64::from_le_bytes(buf[22..30].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(buf[30..34].try_into().unwrap());
        let actual_crc = crc32::compute(&buf[..30]);
        if stored_crc != actual_crc {
            return Err(Error::FormatError);
        }
        let config = Config::new(block_size, inode_size, num_blocks, num_inodes)
            .map_err(|_| Error::FormatError)?;
        Ok(Self { config })
    }
}
