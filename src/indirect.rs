//! Maps a file's logical block index to a physical data block number through
//! the inode's direct and multi-level indirect pointers, allocating on write
//! and freeing post-order on truncate/inode-free.
//!
//! Pointer slot layout (matching [`crate::inode::Inode::pointers`]):
//! `[d0..d11, single, double, triple]`. A pointer value of `0` is the
//! "unallocated" sentinel at every level.

use crate::bitmap::Bitmap;
use crate::block_device::BlockDevice;
use crate::error::{Error, Result};
use crate::superblock::{Config, DIRECT_POINTERS};

/// Number of logical blocks addressable through direct pointers alone.
fn direct_count() -> u64 {
    DIRECT_POINTERS as u64
}

/// The first-past-the-end logical block index for this geometry.
pub fn max_logical_blocks(config: &Config) -> u64 {
    let n = config.pointers_per_block();
    direct_count() + n + n * n + n * n * n
}

enum Region {
    Direct(usize),
    Single(u64),
    Double(u64),
    Triple(u64),
}

fn classify(config: &Config, l: u64) -> Result<Region> {
    let n = config.pointers_per_block();
    if l < direct_count() {
        Ok(Region::Direct(l as usize))
    } else if l < direct_count() + n {
        Ok(Region::Single(l - direct_count()))
    } else if l < direct_count() + n + n * n {
        Ok(Region::Double(l - direct_count() - n))
    } else if l < direct_count() + n + n * n + n * n * n {
        Ok(Region::Triple(l - direct_count() - n - n * n))
    } else {
        Err(Error::FileTooLarge)
    }
}

fn read_ptrs(dev: &mut dyn BlockDevice, config: &Config, block: u32) -> Result<Vec<u32>> {
    let mut raw = vec![0u8; config.block_size as usize];
    dev.read_block(config.data_block_physical(block), &mut raw)?;
    Ok(raw.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect())
}

fn write_ptrs(dev: &mut dyn BlockDevice, config: &Config, block: u32, ptrs: &[u32]) -> Result<()> {
    let mut raw = vec![0u8; config.block_size as usize];
    for (i, p) in ptrs.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    dev.write_block(config.data_block_physical(block), &raw)
}

fn zero_block(dev: &mut dyn BlockDevice, config: &Config, block: u32) -> Result<()> {
    let raw = vec![0u8; config.block_size as usize];
    dev.write_block(config.data_block_physical(block), &raw)
}

/// Reads the physical block number at `idx` hops below `root_ptr` without
/// allocating. Returns the zero sentinel on any hole along the path.
fn resolve_read(dev: &mut dyn BlockDevice, config: &Config, root_ptr: u32, level: u32, idx: u64) -> Result<u32> {
    if level == 0 {
        return Ok(root_ptr);
    }
    if root_ptr == 0 {
        return Ok(0);
    }
    let n = config.pointers_per_block();
    let stride = n.pow(level - 1);
    let child_idx = (idx / stride) as usize;
    let remainder = idx % stride;
    let ptrs = read_ptrs(dev, config, root_ptr)?;
    resolve_read(dev, config, ptrs[child_idx], level - 1, remainder)
}

/// As [`resolve_read`] but allocates and zeroes missing interior and leaf
/// blocks along the path, writing back any pointer that changed.
fn resolve_alloc(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    root_ptr: &mut u32,
    level: u32,
    idx: u64,
) -> Result<u32> {
    if level == 0 {
        if *root_ptr == 0 {
            let b = data_bitmap.alloc()? as u32;
            zero_block(dev, config, b)?;
            *root_ptr = b;
        }
        return Ok(*root_ptr);
    }
    if *root_ptr == 0 {
        let b = data_bitmap.alloc()? as u32;
        zero_block(dev, config, b)?;
        *root_ptr = b;
    }
    let n = config.pointers_per_block();
    let stride = n.pow(level - 1);
    let child_idx = (idx / stride) as usize;
    let remainder = idx % stride;
    let mut ptrs = read_ptrs(dev, config, *root_ptr)?;
    let mut child = ptrs[child_idx];
    let result = resolve_alloc(dev, config, data_bitmap, &mut child, level - 1, remainder)?;
    if child != ptrs[child_idx] {
        ptrs[child_idx] = child;
        write_ptrs(dev, config, *root_ptr, &ptrs)?;
    }
    Ok(result)
}

/// Returns the physical block backing logical block `l`, or the zero
/// sentinel if `l` falls in a hole. Never allocates.
pub fn get_for_read(dev: &mut dyn BlockDevice, config: &Config, pointers: &[u32; 15], l: u64) -> Result<u32> {
    match classify(config, l)? {
        Region::Direct(i) => Ok(pointers[i]),
        Region::Single(rem) => resolve_read(dev, config, pointers[12], 1, rem),
        Region::Double(rem) => resolve_read(dev, config, pointers[13], 2, rem),
        Region::Triple(rem) => resolve_read(dev, config, pointers[14], 3, rem),
    }
}

/// Returns the physical block backing logical block `l`, allocating and
/// zeroing any missing interior or leaf block along the way.
pub fn get_for_write(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    pointers: &mut [u32; 15],
    l: u64,
) -> Result<u32> {
    match classify(config, l)? {
        Region::Direct(i) => {
            if pointers[i] == 0 {
                let b = data_bitmap.alloc()? as u32;
                zero_block(dev, config, b)?;
                pointers[i] = b;
            }
            Ok(pointers[i])
        }
        Region::Single(rem) => resolve_alloc(dev, config, data_bitmap, &mut pointers[12], 1, rem),
        Region::Double(rem) => resolve_alloc(dev, config, data_bitmap, &mut pointers[13], 2, rem),
        Region::Triple(rem) => resolve_alloc(dev, config, data_bitmap, &mut pointers[14], 3, rem),
    }
}

/// Frees every block reachable from `pointers`, post-order, and resets the
/// array to all zero sentinels. Used when an inode is freed.
pub fn free_all(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    pointers: &mut [u32; 15],
) -> Result<()> {
    for slot in pointers.iter_mut().take(DIRECT_POINTERS) {
        if *slot != 0 {
            data_bitmap.free(*slot as u64)?;
            *slot = 0;
        }
    }
    free_subtree(dev, config, data_bitmap, &mut pointers[12], 1)?;
    free_subtree(dev, config, data_bitmap, &mut pointers[13], 2)?;
    free_subtree(dev, config, data_bitmap, &mut pointers[14], 3)?;
    Ok(())
}

fn free_subtree(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    root_ptr: &mut u32,
    level: u32,
) -> Result<()> {
    if *root_ptr == 0 {
        return Ok(());
    }
    let ptrs = read_ptrs(dev, config, *root_ptr)?;
    for &p in &ptrs {
        if p == 0 {
            continue;
        }
        if level == 1 {
            data_bitmap.free(p as u64)?;
        } else {
            let mut p = p;
            free_subtree(dev, config, data_bitmap, &mut p, level - 1)?;
        }
    }
    data_bitmap.free(*root_ptr as u64)?;
    *root_ptr = 0;
    Ok(())
}

/// Frees every leaf at or beyond logical block `new_block_count`, then frees
/// any interior block whose children all became zero sentinels as a result,
/// post-order.
pub fn truncate_from(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    pointers: &mut [u32; 15],
    new_block_count: u64,
) -> Result<()> {
    for (i, slot) in pointers.iter_mut().take(DIRECT_POINTERS).enumerate() {
        if *slot != 0 && i as u64 >= new_block_count {
            data_bitmap.free(*slot as u64)?;
            *slot = 0;
        }
    }
    let n = config.pointers_per_block();
    truncate_subtree(dev, config, data_bitmap, &mut pointers[12], 1, direct_count(), new_block_count)?;
    truncate_subtree(
        dev,
        config,
        data_bitmap,
        &mut pointers[13],
        2,
        direct_count() + n,
        new_block_count,
    )?;
    truncate_subtree(
        dev,
        config,
        data_bitmap,
        &mut pointers[14],
        3,
        direct_count() + n + n * n,
        new_block_count,
    )?;
    Ok(())
}

fn truncate_subtree(
    dev: &mut dyn BlockDevice,
    config: &Config,
    data_bitmap: &mut Bitmap,
    root_ptr: &mut u32,
    level: u32,
    base_logical: u64,
    new_block_count: u64,
) -> Result<()> {
    if *root_ptr == 0 {
        return Ok(());
    }
    let n = config.pointers_per_block();
    let stride = n.pow(level - 1);
    let mut ptrs = read_ptrs(dev, config, *root_ptr)?;
    let mut any_remaining = false;
    let mut changed = false;

    for (idx, child) in ptrs.iter_mut().enumerate() {
        if *child == 0 {
            continue;
        }
        let child_base = base_logical + idx as u64 * stride;
        if level == 1 {
            if child_base >= new_block_count {
                data_bitmap.free(*child as u64)?;
                *child = 0;
                changed = true;
            } else {
                any_remaining = true;
            }
        } else {
            let mut c = *child;
            truncate_subtree(dev, config, data_bitmap, &mut c, level - 1, child_base, new_block_count)?;
            if c != *child {
                *child = c;
                changed = true;
            }
            if *child != 0 {
                any_remaining = true;
            }
        }
    }

    if changed {
        write_ptrs(dev, config, *root_ptr, &ptrs)?;
    }
    if !any_remaining {
        data_bitmap.free(*root_ptr as u64)?;
        *root_ptr = 0;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_device::InMemoryBlockDevice;

    fn setup(block_size: u32, data_blocks: u64) -> (InMemoryBlockDevice, Config, Bitmap) {
        let config = Config::new(block_size, 128, data_blocks, 16).unwrap();
        let dev = InMemoryBlockDevice::new(block_size, config.total_device_blocks());
        let mut bitmap = Bitmap::new(data_blocks);
        bitmap.reserve(0);
        (dev, config, bitmap)
    }

    #[test]
    fn direct_blocks_allocate_on_write_and_read_back() {
        let (mut dev, config, mut bitmap) = setup(64, 64);
        let mut pointers = [0u32; 15];
        let b = get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, 0).unwrap();
        assert_ne!(b, 0);
        assert_eq!(get_for_read(&mut dev, &config, &pointers, 0).unwrap(), b);
    }

    #[test]
    fn unwritten_direct_block_reads_as_hole() {
        let (mut dev, config, _bitmap) = setup(64, 64);
        let pointers = [0u32; 15];
        assert_eq!(get_for_read(&mut dev, &config, &pointers, 3).unwrap(), 0);
    }

    #[test]
    fn single_indirect_round_trips() {
        let (mut dev, config, mut bitmap) = setup(64, 4096);
        let mut pointers = [0u32; 15];
        let l = 12 + 3; // third single-indirect slot
        let b = get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, l).unwrap();
        assert_ne!(b, 0);
        assert_eq!(get_for_read(&mut dev, &config, &pointers, l).unwrap(), b);
        // a different slot in the same indirect block stays a hole
        assert_eq!(get_for_read(&mut dev, &config, &pointers, 12).unwrap(), 0);
    }

    #[test]
    fn double_indirect_round_trips() {
        let n = 16u64; // 64 / 4
        let (mut dev, config, mut bitmap) = setup(64, 2 + n + n * n + 4);
        let mut pointers = [0u32; 15];
        let l = 12 + n + (n * n - 1); // last double-indirect slot
        let b = get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, l).unwrap();
        assert_ne!(b, 0);
        assert_eq!(get_for_read(&mut dev, &config, &pointers, l).unwrap(), b);
    }

    #[test]
    fn file_too_large_past_triple_indirect_ceiling() {
        let (mut dev, config, _bitmap) = setup(64, 64);
        let pointers = [0u32; 15];
        let past = max_logical_blocks(&config);
        assert!(matches!(
            get_for_read(&mut dev, &config, &pointers, past),
            Err(Error::FileTooLarge)
        ));
    }

    #[test]
    fn free_all_reclaims_every_allocated_block() {
        let (mut dev, config, mut bitmap) = setup(64, 4096);
        let mut pointers = [0u32; 15];
        for l in [0u64, 5, 12, 20, 12 + 16 + 3] {
            get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, l).unwrap();
        }
        let used_before = bitmap.count_set();
        assert!(used_before > 1); // plus the reserved index 0
        free_all(&mut dev, &config, &mut bitmap, &mut pointers).unwrap();
        assert_eq!(bitmap.count_set(), 1); // only the reserved index remains
        assert!(pointers.iter().all(|&p| p == 0));
    }

    #[test]
    fn truncate_frees_leaves_and_empty_interior_blocks() {
        let (mut dev, config, mut bitmap) = setup(64, 4096);
        let mut pointers = [0u32; 15];
        get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, 0).unwrap();
        get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, 12 + 2).unwrap();
        let used_before = bitmap.count_set();

        truncate_from(&mut dev, &config, &mut bitmap, &mut pointers, 1).unwrap();

        assert_ne!(pointers[0], 0); // block 0 survives (index 0 < new_block_count=1)
        assert_eq!(pointers[12], 0); // the single-indirect subtree is now empty, freed
        assert!(bitmap.count_set() < used_before);
    }

    #[test]
    fn truncate_idempotence() {
        let (mut dev, config, mut bitmap) = setup(64, 4096);
        let mut pointers = [0u32; 15];
        get_for_write(&mut dev, &config, &mut bitmap, &mut pointers, 12 + 5).unwrap();
        truncate_from(&mut dev, &config, &mut bitmap, &mut pointers, 2).unwrap();
        let after_first = pointers;
        let used_after_first = bitmap.count_set();
        truncate_from(&mut dev, &config, &mut bitmap, &mut pointers, 2).unwrap();
        assert_eq!(pointers, after_first);
        assert_eq!(bitmap.count_set(), used_after_first);
    }
}
