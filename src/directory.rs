//! Named-entry directories, serialized as a flat list into the directory
//! inode's own byte body and read/written through the same inode I/O as a
//! regular file.

use std::cell::RefCell;
use std::ops::BitOr;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::file::{self, FileHandle};
use crate::fs::Inner;
use crate::inode::{Inode, Mode};

/// Mode flags an [`Directory::open`] call is gated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 3);
    pub const APPEND: OpenFlags = OpenFlags(1 << 4);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(1 << 5);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

struct Entry {
    ino: u64,
    name: Vec<u8>,
}

/// Directory names are arbitrary non-empty byte strings, not necessarily
/// valid UTF-8 — only `/` and NUL are excluded, and the on-disk entry format
/// (§6) stores them as raw bytes. `AsRef<[u8]>` lets callers pass an
/// ordinary `&str` literal without this module ever assuming the bytes
/// decode as text.
fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > 65535 || name.contains(&b'/') || name.contains(&0u8) {
        return Err(Error::InvalidName);
    }
    Ok(())
}

fn read_entries(inner: &mut Inner, ino: u64) -> Result<Vec<Entry>> {
    let size = inner.inodes.load_inode(inner.device.as_mut(), ino)?.size as usize;
    let mut buf = vec![0u8; size];
    file::read_at(inner, ino, 0, &mut buf)?;

    let mut entries = Vec::new();
    let mut off = 0;
    while off + 6 <= buf.len() {
        let name_len = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
        let entry_ino = u32::from_le_bytes(buf[off + 2..off + 6].try_into().unwrap()) as u64;
        off += 6;
        if off + name_len > buf.len() {
            break;
        }
        let name = buf[off..off + name_len].to_vec();
        off += name_len;
        entries.push(Entry { ino: entry_ino, name });
    }
    Ok(entries)
}

fn write_entries(inner: &mut Inner, ino: u64, entries: &[Entry]) -> Result<()> {
    let mut buf = Vec::new();
    for e in entries {
        buf.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(e.ino as u32).to_le_bytes());
        buf.extend_from_slice(&e.name);
    }
    file::set_len(inner, ino, 0)?;
    if !buf.is_empty() {
        file::write_at(inner, ino, 0, &buf)?;
    }
    Ok(())
}

/// Whether `target` is `root` itself, or reachable by descending through
/// `root`'s subdirectories. Used to reject a rename that would move a
/// directory into its own descendant.
fn is_in_subtree(inner: &mut Inner, root: u64, target: u64) -> Result<bool> {
    if root == target {
        return Ok(true);
    }
    for e in read_entries(inner, root)? {
        let child = inner.inodes.load_inode(inner.device.as_mut(), e.ino)?;
        if child.mode == Mode::Directory && is_in_subtree(inner, e.ino, target)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A handle onto one directory inode.
#[derive(Clone)]
pub struct Directory {
    inner: Rc<RefCell<Inner>>,
    ino: u64,
}

impl Directory {
    pub(crate) fn new(inner: Rc<RefCell<Inner>>, ino: u64) -> Self {
        Self { inner, ino }
    }

    /// Lists the names of every live entry, in insertion order.
    pub fn listdir(&self) -> Result<Vec<Vec<u8>>> {
        crate::fs::with_inner(&self.inner, |inner| {
            Ok(read_entries(inner, self.ino)?.into_iter().map(|e| e.name).collect())
        })
    }

    /// Resolves `name` to its inode index.
    pub fn lookup(&self, name: impl AsRef<[u8]>) -> Result<u64> {
        let name = name.as_ref();
        validate_name(name)?;
        crate::fs::with_inner(&self.inner, |inner| {
            read_entries(inner, self.ino)?
                .into_iter()
                .find(|e| e.name == name)
                .map(|e| e.ino)
                .ok_or(Error::NotFound)
        })
    }

    /// Opens (optionally creating) the regular file named `name`.
    pub fn open(&self, name: impl AsRef<[u8]>, flags: OpenFlags) -> Result<FileHandle> {
        let name = name.as_ref();
        validate_name(name)?;
        let ino = crate::fs::with_inner(&self.inner, |inner| {
            let mut entries = read_entries(inner, self.ino)?;
            match entries.iter().position(|e| e.name == name) {
                Some(pos) => {
                    if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
                        return Err(Error::Exists);
                    }
                    let existing_ino = entries[pos].ino;
                    let existing = inner.inodes.load_inode(inner.device.as_mut(), existing_ino)?;
                    if existing.mode != Mode::File {
                        return Err(Error::IsDir);
                    }
                    if flags.contains(OpenFlags::TRUNCATE) {
                        file::set_len(inner, existing_ino, 0)?;
                    }
                    Ok(existing_ino)
                }
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(Error::NotFound);
                    }
                    let inode = Inode::new(Mode::File);
                    let new_ino = inner.inodes.alloc(inner.device.as_mut(), &inode)?;
                    entries.push(Entry {
                        ino: new_ino,
                        name: name.to_vec(),
                    });
                    write_entries(inner, self.ino, &entries)?;
                    Ok(new_ino)
                }
            }
        })?;
        Ok(FileHandle::new(self.inner.clone(), ino, flags))
    }

    /// Creates a new, empty subdirectory named `name`.
    pub fn mkdir(&self, name: impl AsRef<[u8]>) -> Result<Directory> {
        let name = name.as_ref();
        validate_name(name)?;
        let ino = crate::fs::with_inner(&self.inner, |inner| {
            let mut entries = read_entries(inner, self.ino)?;
            if entries.iter().any(|e| e.name == name) {
                return Err(Error::Exists);
            }
            let inode = Inode::new(Mode::Directory);
            let new_ino = inner.inodes.alloc(inner.device.as_mut(), &inode)?;
            entries.push(Entry {
                ino: new_ino,
                name: name.to_vec(),
            });
            write_entries(inner, self.ino, &entries)?;
            Ok(new_ino)
        })?;
        Ok(Directory::new(self.inner.clone(), ino))
    }

    /// Removes the empty subdirectory named `name`.
    pub fn rmdir(&self, name: impl AsRef<[u8]>) -> Result<()> {
        let name = name.as_ref();
        validate_name(name)?;
        crate::fs::with_inner(&self.inner, |inner| {
            let mut entries = read_entries(inner, self.ino)?;
            let pos = entries.iter().position(|e| e.name == name).ok_or(Error::NotFound)?;
            let target_ino = entries[pos].ino;
            let target = inner.inodes.load_inode(inner.device.as_mut(), target_ino)?;
            if target.mode != Mode::Directory {
                return Err(Error::NotDir);
            }
            if !read_entries(inner, target_ino)?.is_empty() {
                return Err(Error::NotEmpty);
            }
            file::free_inode(inner, target_ino)?;
            entries.remove(pos);
            write_entries(inner, self.ino, &entries)
        })
    }

    /// Removes the regular file named `name`.
    pub fn unlink(&self, name: impl AsRef<[u8]>) -> Result<()> {
        let name = name.as_ref();
        validate_name(name)?;
        crate::fs::with_inner(&self.inner, |inner| {
            let mut entries = read_entries(inner, self.ino)?;
            let pos = entries.iter().position(|e| e.name == name).ok_or(Error::NotFound)?;
            let target_ino = entries[pos].ino;
            let target = inner.inodes.load_inode(inner.device.as_mut(), target_ino)?;
            if target.mode != Mode::File {
                return Err(Error::IsDir);
            }
            file::free_inode(inner, target_ino)?;
            entries.remove(pos);
            write_entries(inner, self.ino, &entries)
        })
    }

    /// Moves `name` from this directory to `dest_name` in `dest`,
    /// atomically replacing an existing destination entry of a compatible
    /// kind (empty directory or regular file).
    pub fn rename(&self, name: impl AsRef<[u8]>, dest: &Directory, dest_name: impl AsRef<[u8]>) -> Result<()> {
        let name = name.as_ref();
        let dest_name = dest_name.as_ref();
        validate_name(name)?;
        validate_name(dest_name)?;
        crate::fs::with_inner(&self.inner, |inner| {
            let mut src_entries = read_entries(inner, self.ino)?;
            let pos = src_entries.iter().position(|e| e.name == name).ok_or(Error::NotFound)?;
            let moving_ino = src_entries[pos].ino;
            let moving = inner.inodes.load_inode(inner.device.as_mut(), moving_ino)?;

            if moving.mode == Mode::Directory && is_in_subtree(inner, moving_ino, dest.ino)? {
                return Err(Error::Loop);
            }

            let same_dir = self.ino == dest.ino;
            let mut dest_entries = if same_dir {
                src_entries.clone()
            } else {
                read_entries(inner, dest.ino)?
            };

            if let Some(existing_pos) = dest_entries.iter().position(|e| e.name == dest_name) {
                let existing_ino = dest_entries[existing_pos].ino;
                if existing_ino == moving_ino {
                    return Ok(());
                }
                let existing = inner.inodes.load_inode(inner.device.as_mut(), existing_ino)?;
                match (existing.mode, moving.mode) {
                    (Mode::Directory, Mode::Directory) => {
                        if !read_entries(inner, existing_ino)?.is_empty() {
                            return Err(Error::NotEmpty);
                        }
                    }
                    (Mode::Directory, Mode::File) => return Err(Error::IsDir),
                    (Mode::File, Mode::Directory) => return Err(Error::NotDir),
                    (Mode::File, Mode::File) => {}
                }
                file::free_inode(inner, existing_ino)?;
                dest_entries.remove(existing_pos);
            }

            if same_dir {
                let src_pos_in_dest = dest_entries.iter().position(|e| e.name == name).unwrap();
                dest_entries.remove(src_pos_in_dest);
                dest_entries.push(Entry {
                    ino: moving_ino,
                    name: dest_name.to_vec(),
                });
                write_entries(inner, self.ino, &dest_entries)
            } else {
                src_entries.remove(pos);
                dest_entries.push(Entry {
                    ino: moving_ino,
                    name: dest_name.to_vec(),
                });
                write_entries(inner, self.ino, &src_entries)?;
                write_entries(inner, dest.ino, &dest_entries)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs;
    use crate::superblock::Config;

    fn mounted() -> fs::Mount {
        let config = Config::new(64, 128, 4096, 64).unwrap();
        fs::format_in_memory(config).unwrap()
    }

    #[test]
    fn mkdir_listdir_lookup() {
        let mount = mounted();
        let root = mount.root();
        root.mkdir("a").unwrap();
        root.open("b.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let mut names = root.listdir().unwrap();
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b.txt".to_vec()]);
        assert!(root.lookup("a").is_ok());
        assert!(matches!(root.lookup("missing"), Err(Error::NotFound)));
    }

    #[test]
    fn create_existing_without_exclusive_reopens_it() {
        let mount = mounted();
        let root = mount.root();
        let ino1 = root.open("f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        drop(ino1);
        let ino2 = root.open("f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        drop(ino2);
        assert_eq!(root.listdir().unwrap(), vec![b"f".to_vec()]);
    }

    #[test]
    fn create_exclusive_on_existing_name_fails() {
        let mount = mounted();
        let root = mount.root();
        root.open("f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let result = root.open("f", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE);
        assert!(matches!(result, Err(Error::Exists)));
    }

    #[test]
    fn rmdir_rejects_non_empty() {
        let mount = mounted();
        let root = mount.root();
        let sub = root.mkdir("sub").unwrap();
        sub.open("x", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        assert!(matches!(root.rmdir("sub"), Err(Error::NotEmpty)));
    }

    #[test]
    fn rmdir_removes_empty_directory() {
        let mount = mounted();
        let root = mount.root();
        root.mkdir("sub").unwrap();
        root.rmdir("sub").unwrap();
        assert_eq!(root.listdir().unwrap().len(), 0);
    }

    #[test]
    fn unlink_on_a_directory_is_is_dir() {
        let mount = mounted();
        let root = mount.root();
        root.mkdir("sub").unwrap();
        assert!(matches!(root.unlink("sub"), Err(Error::IsDir)));
    }

    #[test]
    fn rename_across_directories() {
        let mount = mounted();
        let root = mount.root();
        let dest = root.mkdir("dest").unwrap();
        root.open("f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        root.rename("f", &dest, "g").unwrap();
        assert!(matches!(root.lookup("f"), Err(Error::NotFound)));
        assert!(dest.lookup("g").is_ok());
    }

    #[test]
    fn rename_rejects_moving_a_directory_into_its_own_descendant() {
        let mount = mounted();
        let root = mount.root();
        let a = root.mkdir("a").unwrap();
        let b = a.mkdir("b").unwrap();
        assert!(matches!(root.rename("a", &b, "a_again"), Err(Error::Loop)));
    }

    #[test]
    fn rename_onto_nonempty_directory_is_not_empty() {
        let mount = mounted();
        let root = mount.root();
        root.mkdir("a").unwrap();
        let b = root.mkdir("b").unwrap();
        b.open("x", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        assert!(matches!(root.rename("a", &root.clone(), "b"), Err(Error::NotEmpty)));
    }
}
