//! Packed bit-vector allocator used for both the inode and data-block
//! free/used tracking.

use crate::block_device::BlockDevice;
use crate::error::{Error, Result};

/// Tracks allocation state over `len` indices with a packed bit per index.
///
/// Allocation is first-fit starting from a rotating in-memory hint, which
/// keeps successive allocations spread out rather than always probing from
/// index 0. The hint is not persisted: losing it across a mount only changes
/// which free index gets picked next, never correctness.
pub struct Bitmap {
    bits: Vec<u8>,
    len: u64,
    hint: u64,
}

impl Bitmap {
    /// Creates an all-free bitmap over `len` indices.
    pub fn new(len: u64) -> Self {
        Self {
            bits: vec![0u8; crate::util::ceil_div(len, 8) as usize],
            len,
            hint: 0,
        }
    }

    /// Reads a bitmap of `len` indices back from `block_count` blocks
    /// starting at `start_block`.
    pub fn load(
        dev: &mut dyn BlockDevice,
        start_block: u64,
        block_count: u64,
        len: u64,
    ) -> Result<Self> {
        let block_size = dev.block_size() as usize;
        let mut raw = vec![0u8; block_count as usize * block_size];
        for i in 0..block_count {
            let chunk = &mut raw[i as usize * block_size..(i as usize + 1) * block_size];
            dev.read_block(start_block + i, chunk)?;
        }
        raw.truncate(crate::util::ceil_div(len, 8) as usize);
        Ok(Self {
            bits: raw,
            len,
            hint: 0,
        })
    }

    /// Persists this bitmap to `block_count` blocks starting at
    /// `start_block`, zero-padding up to the block boundary.
    pub fn store(&self, dev: &mut dyn BlockDevice, start_block: u64, block_count: u64) -> Result<()> {
        let block_size = dev.block_size() as usize;
        let mut raw = vec![0u8; block_count as usize * block_size];
        raw[..self.bits.len()].copy_from_slice(&self.bits);
        for i in 0..block_count {
            let chunk = &raw[i as usize * block_size..(i as usize + 1) * block_size];
            dev.write_block(start_block + i, chunk)?;
        }
        Ok(())
    }

    /// Whether index `i` is currently in use.
    pub fn is_set(&self, i: u64) -> bool {
        if i >= self.len {
            return false;
        }
        self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    fn set(&mut self, i: u64) {
        self.bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    fn clear(&mut self, i: u64) {
        self.bits[(i / 8) as usize] &= !(1 << (i % 8));
    }

    /// Permanently marks `i` as in use without it ever being freeable,
    /// reserving it (used for the index-0 sentinel at format time).
    pub fn reserve(&mut self, i: u64) {
        self.set(i);
    }

    /// Allocates and returns the lowest free index at or after the current
    /// hint, wrapping around once. Fails with [`Error::NoSpace`] if none is
    /// free.
    pub fn alloc(&mut self) -> Result<u64> {
        for probe in 0..self.len {
            let i = (self.hint + probe) % self.len;
            if !self.is_set(i) {
                self.set(i);
                self.hint = (i + 1) % self.len;
                return Ok(i);
            }
        }
        Err(Error::NoSpace)
    }

    /// Frees a previously allocated index. Freeing an index that is not
    /// currently set is a [`Error::DoubleFree`].
    pub fn free(&mut self, i: u64) -> Result<()> {
        if i >= self.len || !self.is_set(i) {
            return Err(Error::DoubleFree(i));
        }
        self.clear(i);
        Ok(())
    }

    /// Number of indices currently in use.
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Total number of indices tracked.
    pub fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_device::InMemoryBlockDevice;

    #[test]
    fn alloc_is_first_fit_and_conserves_count() {
        let mut bm = Bitmap::new(16);
        let a = bm.alloc().unwrap();
        let b = bm.alloc().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(bm.count_set(), 2);
    }

    #[test]
    fn free_then_alloc_reuses_index() {
        let mut bm = Bitmap::new(4);
        let a = bm.alloc().unwrap();
        let _b = bm.alloc().unwrap();
        bm.free(a).unwrap();
        let c = bm.alloc().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn double_free_errors() {
        let mut bm = Bitmap::new(4);
        let a = bm.alloc().unwrap();
        bm.free(a).unwrap();
        assert!(matches!(bm.free(a), Err(Error::DoubleFree(_))));
    }

    #[test]
    fn exhaustion_errors_no_space() {
        let mut bm = Bitmap::new(2);
        bm.alloc().unwrap();
        bm.alloc().unwrap();
        assert!(matches!(bm.alloc(), Err(Error::NoSpace)));
    }

    #[test]
    fn reserved_index_is_never_handed_out() {
        let mut bm = Bitmap::new(4);
        bm.reserve(0);
        for _ in 0..3 {
            assert_ne!(bm.alloc().unwrap(), 0);
        }
        assert!(matches!(bm.alloc(), Err(Error::NoSpace)));
    }

    #[test]
    fn persists_round_trip_through_blocks() {
        let mut dev = InMemoryBlockDevice::new(64, 4);
        let mut bm = Bitmap::new(100);
        bm.reserve(0);
        let a = bm.alloc().unwrap();
        bm.store(&mut dev, 0, 2).unwrap();

        let loaded = Bitmap::load(&mut dev, 0, 2, 100).unwrap();
        assert!(loaded.is_set(0));
        assert!(loaded.is_set(a));
        assert_eq!(loaded.count_set(), bm.count_set());
    }
}
