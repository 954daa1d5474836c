//! End-to-end scenarios exercising the public façade across a real host
//! file, covering format/mount round trips, indirect-block-forcing writes,
//! and tamper detection on an encrypted image.

use ufs::{Config, Error, OpenFlags, Whence};

fn small_config() -> Config {
    Config::new(64, 128, 4096, 64).unwrap()
}

#[test]
fn format_mount_mkdir_and_reopen_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");

    {
        let mount = ufs::format_in_file(&path, small_config()).unwrap();
        let root = mount.root();
        let docs = root.mkdir("docs").unwrap();
        let mut readme = docs.open("readme.txt", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        readme.write(b"hello, filesystem").unwrap();
        mount.close().unwrap();
    }

    let mount = ufs::mount_in_file(&path).unwrap();
    let root = mount.root();
    assert_eq!(root.listdir().unwrap(), vec![b"docs".to_vec()]);
    let docs = root.open("docs", OpenFlags::READ).err();
    assert!(matches!(docs, Some(Error::IsDir)));

    let docs_ino = root.lookup("docs").unwrap();
    assert!(docs_ino > 0);
}

#[test]
fn large_sequential_write_forces_indirect_blocks_and_reads_back_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let config = small_config();
    // block_size=64 => N=16 pointers per block; 12 direct blocks hold 768
    // bytes, so anything past that forces the single-indirect tree.
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();

    {
        let mount = ufs::format_in_file(&path, config).unwrap();
        let root = mount.root();
        let mut f = root.open("big", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let n = f.write(&payload).unwrap();
        assert_eq!(n, payload.len());
        mount.close().unwrap();
    }

    let mount = ufs::mount_in_file(&path).unwrap();
    let stats = mount.stats().unwrap();
    // direct (12) + at least one indirect pointer block + enough leaves
    assert!(stats.used_blocks as usize > payload.len() / config.block_size as usize);

    let root = mount.root();
    let mut f = root.open("big", OpenFlags::READ).unwrap();
    let mut read_back = vec![0u8; payload.len()];
    let mut total = 0;
    while total < read_back.len() {
        let n = f.read(&mut read_back[total..]).unwrap();
        assert!(n > 0, "short read before reaching end of file");
        total += n;
    }
    assert_eq!(read_back, payload);
}

#[test]
fn sparse_write_then_seek_from_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mount = ufs::format_in_file(&path, small_config()).unwrap();
    let root = mount.root();
    let mut f = root.open("sparse", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    f.seek(1000, Whence::Start).unwrap();
    f.write(b"end").unwrap();

    let pos = f.seek(-3, Whence::End).unwrap();
    assert_eq!(pos, 1000);
    let mut buf = [0u8; 3];
    f.read(&mut buf).unwrap();
    assert_eq!(&buf, b"end");
}

#[test]
fn rename_enforces_not_found_exists_not_empty_and_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let mount = ufs::format_in_file(&path, small_config()).unwrap();
    let root = mount.root();

    assert!(matches!(root.rename("ghost", &root.clone(), "elsewhere"), Err(Error::NotFound)));

    root.open("a", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    let sub = root.mkdir("sub").unwrap();
    sub.open("x", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    let dest = root.mkdir("dest").unwrap();
    dest.open("taken", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();

    // renaming a file onto an existing directory of the same name is IsDir
    assert!(matches!(root.rename("a", &root.clone(), "sub"), Err(Error::IsDir)));

    // moving a non-empty directory onto a file target is NotDir... but here
    // we rename the file "a" onto the non-empty "sub" above already covered;
    // check the reverse: renaming "sub" (non-empty dir) onto "dest" (a dir
    // containing an entry) must fail NotEmpty
    assert!(matches!(root.rename("sub", &root.clone(), "dest"), Err(Error::NotEmpty)));

    // a directory cannot be moved into its own descendant
    let grandchild = sub.mkdir("inner").unwrap();
    assert!(matches!(root.rename("sub", &grandchild, "loop"), Err(Error::Loop)));

    root.rename("a", &dest, "renamed_a").unwrap();
    assert!(dest.lookup("renamed_a").is_ok());
    assert!(matches!(root.lookup("a"), Err(Error::NotFound)));
}

#[test]
fn encrypted_image_tamper_is_detected_on_mount() {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    {
        let mount = ufs::format_in_file_encrypted(&path, small_config(), b"hunter2").unwrap();
        let root = mount.root();
        root.open("f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        mount.close().unwrap();
    }

    // flip a byte well past the header, inside a data block's ciphertext.
    let mut raw = OpenOptions::new().write(true).open(&path).unwrap();
    raw.seek(SeekFrom::Start(300)).unwrap();
    raw.write_all(&[0xff]).unwrap();

    assert!(matches!(
        ufs::mount_in_file_encrypted(&path, b"hunter2"),
        Err(Error::IntegrityError)
    ));

    assert!(matches!(
        ufs::mount_in_file_encrypted(&path, b"not the password"),
        Err(Error::AuthError)
    ));
}

#[test]
fn double_mount_of_the_same_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let _mount = ufs::format_in_file(&path, small_config()).unwrap();
    assert!(matches!(ufs::mount_in_file(&path), Err(Error::AlreadyMounted)));
}
