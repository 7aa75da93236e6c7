//! End-to-end properties of the block engine, exercised through the public
//! API against scratch images. Raw on-disk assertions reopen the image
//! file directly after unmount.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use stegfs::param::BLOCK_SIZE;
use stegfs::{make_image, Error, MkfsOptions, MountOptions, OpenFlags, StegFs};

const MB: u64 = 1 << 20;

/// Small KDF count so the suite spends its time on the engine, not PBKDF2.
const KDF: u64 = 16;

fn image(dir: &TempDir, name: &str, size: u64, duplication: u32) -> PathBuf {
    let p = dir.path().join(name);
    let opts = MkfsOptions {
        size,
        duplication,
        kdf_iterations: KDF,
        ..MkfsOptions::default()
    };
    make_image(&p, &opts).expect("mkfs");
    p
}

fn mount(p: &Path) -> StegFs {
    StegFs::mount(p, MountOptions::default()).expect("mount")
}

fn put(fs: &mut StegFs, p: &str, data: &[u8]) {
    fs.open(p, OpenFlags::WRITE | OpenFlags::CREATE).expect("open for write");
    fs.write(p, 0, data).expect("buffer");
    fs.release(p).expect("flush");
}

fn get(fs: &mut StegFs, p: &str) -> Vec<u8> {
    let len = fs.stat(p).expect("stat").size as usize;
    fs.read(p, 0, len).expect("read")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn tag_of(dir: &str) -> [u8; 32] {
    Sha256::digest(dir.as_bytes()).into()
}

fn raw_tag(bytes: &[u8], idx: u64) -> &[u8] {
    &bytes[idx as usize * BLOCK_SIZE..idx as usize * BLOCK_SIZE + 32]
}

fn corrupt_block(img: &Path, idx: u64) {
    let mut bytes = fs::read(img).expect("read image");
    let off = idx as usize * BLOCK_SIZE;
    for b in &mut bytes[off..off + BLOCK_SIZE] {
        *b ^= 0x5A;
    }
    fs::write(img, bytes).expect("write image");
}

fn epoch_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[test]
fn small_file_lives_in_the_inode_header() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 10 * MB, 8);
    let mut fs = mount(&img);

    put(&mut fs, "/greetings/hi", b"hello");
    let attr = fs.stat("/greetings/hi").unwrap();
    assert_eq!(attr.size, 5);
    assert!(attr.mtime + 10 >= epoch_now());
    assert_eq!(get(&mut fs, "/greetings/hi"), b"hello");

    let map = fs.file_map("/greetings/hi").unwrap();
    assert_eq!(map.inodes.len(), 8);
    assert!(map.chains.iter().all(Vec::is_empty), "no data blocks needed");
    // the superblock plus eight inode blocks
    assert_eq!(fs.info().blocks_used, 9);
}

#[test]
fn password_file_spans_a_chain() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 10 * MB, 8);
    let body = pattern(10000);

    let mut fs = mount(&img);
    put(&mut fs, "/docs/report:secret", &body);
    let map = fs.file_map("/docs/report:secret").unwrap();
    assert!(map.chains.iter().all(|c| c.len() == 5));
    assert_eq!(fs.info().blocks_used, 1 + 8 + 40);
    fs.unmount().unwrap();

    let mut fs = mount(&img);
    assert!(matches!(fs.stat("/docs/report:wrong"), Err(Error::NotFound)));
    assert!(matches!(fs.stat("/docs/report"), Err(Error::NotFound)));
    assert_eq!(get(&mut fs, "/docs/report:secret"), body);
    assert_eq!(fs.readdir("/docs").unwrap(), ["report"]);
}

#[test]
fn oversized_file_is_rejected_up_front() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 10 * MB, 8);
    let mut fs = mount(&img);

    fs.open("/big", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    let body = vec![0u8; 6 * MB as usize];
    assert!(matches!(fs.write("/big", 0, &body), Err(Error::TooLarge)));
}

#[test]
fn filling_the_disk_reports_no_space() {
    let t = TempDir::new().unwrap();
    // 512 blocks, 8 copies: each ~60 KiB file takes 248 of the 511
    // usable blocks, so a third can never fit
    let img = image(&t, "img", MB, 8);
    let mut fs = mount(&img);
    let body = pattern(60_000);

    put(&mut fs, "/f0", &body);
    put(&mut fs, "/f1", &body);
    fs.open("/f2", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
    assert!(matches!(fs.write("/f2", 0, &body), Err(Error::NoSpace)));
    assert_eq!(get(&mut fs, "/f0"), body);
    assert_eq!(get(&mut fs, "/f1"), body);
}

#[test]
fn delete_scrubs_and_frees() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 4);
    let mut fs = mount(&img);

    put(&mut fs, "/dir/f:x", &pattern(5000));
    let map = fs.file_map("/dir/f:x").unwrap();
    let victims: Vec<u64> = map
        .inodes
        .iter()
        .chain(map.chains.iter().flatten())
        .copied()
        .collect();
    fs.unlink("/dir/f:x").unwrap();
    assert_eq!(fs.info().blocks_used, 1, "only the superblock remains");
    assert!(matches!(fs.stat("/dir/f:x"), Err(Error::NotFound)));
    fs.unmount().unwrap();

    // every former block is noise again: no parent tag survives
    let bytes = fs::read(&img).unwrap();
    let tag = tag_of("/dir");
    for idx in victims {
        assert_ne!(raw_tag(&bytes, idx), &tag[..]);
    }

    // and a larger file can take their place
    let mut fs = mount(&img);
    let body = pattern(20_000);
    put(&mut fs, "/dir/h:y", &body);
    assert_eq!(get(&mut fs, "/dir/h:y"), body);
}

#[test]
fn paranoid_mount_supplies_every_parameter() {
    let t = TempDir::new().unwrap();
    let img = t.path().join("img");
    let opts = MkfsOptions {
        size: 4 * MB,
        duplication: 2,
        kdf_iterations: KDF,
        paranoid: true,
        ..MkfsOptions::default()
    };
    make_image(&img, &opts).expect("mkfs");

    // the image carries no header at all
    assert!(matches!(
        StegFs::mount(&img, MountOptions::default()),
        Err(Error::NotStegfs)
    ));

    let paranoid = MountOptions {
        paranoid: true,
        duplication: 2,
        kdf_iterations: KDF,
        ..MountOptions::default()
    };
    let mut fs = StegFs::mount(&img, paranoid.clone()).unwrap();
    let body = pattern(3000);
    put(&mut fs, "/docs/x:pw", &body);
    fs.unmount().unwrap();

    // wrong parameters surface as not-found, nothing more specific
    let wrong = MountOptions { kdf_iterations: 999, ..paranoid.clone() };
    let mut fs = StegFs::mount(&img, wrong).unwrap();
    assert!(matches!(fs.stat("/docs/x:pw"), Err(Error::NotFound)));
    fs.unmount().unwrap();

    let mut fs = StegFs::mount(&img, paranoid).unwrap();
    assert_eq!(get(&mut fs, "/docs/x:pw"), body);
}

#[test]
fn directories_are_a_cache_side_fiction() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 2);
    let mut fs = mount(&img);

    fs.mkdir("/scratch").unwrap();
    assert!(fs.readdir("/").unwrap().contains(&"scratch".to_owned()));

    put(&mut fs, "/a/b/c", b"deep");
    assert_eq!(fs.readdir("/a").unwrap(), ["b"]);
    fs.unmount().unwrap();

    let mut fs = mount(&img);
    // no on-disk listing: everything is forgotten...
    assert!(fs.readdir("/").unwrap().is_empty());
    assert!(fs.readdir("/a").unwrap().is_empty());
    // ...until a stat proves the file and materializes its ancestry
    assert_eq!(fs.stat("/a/b/c").unwrap().size, 4);
    assert_eq!(fs.readdir("/a").unwrap(), ["b"]);
    assert!(fs.readdir("/").unwrap().contains(&"a".to_owned()));
}

#[test]
fn redundancy_survives_three_of_four_copies_lost() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 16 * MB, 4);
    let body = pattern(1024 + 1976 + 500); // header + two chain blocks

    let mut fs = mount(&img);
    put(&mut fs, "/vault/doc:pw", &body);
    let map = fs.file_map("/vault/doc:pw").unwrap();
    assert!(map.chains.iter().all(|c| c.len() == 2));
    fs.unmount().unwrap();

    let lose_copy = |copy: usize| {
        corrupt_block(&img, map.inodes[copy]);
        for &b in &map.chains[copy] {
            corrupt_block(&img, b);
        }
    };

    // copy 0 (the MAC authority) goes first; the survivors must still
    // verify against its stored MAC
    lose_copy(0);
    let mut fs = mount(&img);
    assert_eq!(get(&mut fs, "/vault/doc:pw"), body);
    fs.unmount().unwrap();

    lose_copy(1);
    lose_copy(2);
    let mut fs = mount(&img);
    assert_eq!(get(&mut fs, "/vault/doc:pw"), body);
    fs.unmount().unwrap();

    // losing the last copy loses the file
    lose_copy(3);
    let mut fs = mount(&img);
    assert!(fs.open("/vault/doc:pw", OpenFlags::READ).is_err());
}

#[test]
fn single_block_damage_fails_only_that_copy() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 16 * MB, 2);
    let body = pattern(4000);

    let mut fs = mount(&img);
    put(&mut fs, "/p/f:k", &body);
    let map = fs.file_map("/p/f:k").unwrap();
    fs.unmount().unwrap();

    // damage copy 0 first: copy 1 must satisfy copy 0's MAC on its own
    corrupt_block(&img, map.chains[0][0]);
    let mut fs = mount(&img);
    assert_eq!(get(&mut fs, "/p/f:k"), body);
    fs.unmount().unwrap();

    corrupt_block(&img, map.chains[1][0]);
    let mut fs = mount(&img);
    match fs.open("/p/f:k", OpenFlags::READ) {
        Err(Error::NotFound) | Err(Error::IntegrityFailure) => {}
        other => panic!("expected a failed read, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn every_used_block_carries_the_parent_tag() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 10 * MB, 8);
    let mut fs = mount(&img);
    put(&mut fs, "/docs/report:secret", &pattern(10000));
    let map = fs.file_map("/docs/report:secret").unwrap();
    fs.unmount().unwrap();

    let bytes = fs::read(&img).unwrap();
    let tag = tag_of("/docs");
    for idx in map.inodes.iter().chain(map.chains.iter().flatten()) {
        assert_eq!(raw_tag(&bytes, *idx), &tag[..]);
    }
}

#[test]
fn fresh_image_is_statistically_noise() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 2);
    let bytes = fs::read(&img).unwrap();

    let mut counts = [0u64; 256];
    for b in &bytes {
        counts[*b as usize] += 1;
    }
    let mean = bytes.len() as f64 / 256.0;
    for (value, count) in counts.iter().enumerate() {
        let delta = (*count as f64 - mean).abs();
        // ~12 sigma at this sample size; uniform noise never trips it
        assert!(delta < 1500.0, "byte {:#x} count {} vs mean {}", value, count, mean);
    }
}

#[test]
fn allocator_avoids_ancestor_blocks_across_mounts() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 8 * MB, 2);
    let body = pattern(1024 + 49 * 1976); // 49 chain blocks per copy

    let mut fs = mount(&img);
    put(&mut fs, "/a/f1", &body);
    let f1 = fs.file_map("/a/f1").unwrap();
    fs.unmount().unwrap();

    // a fresh mount has an empty tracker; only the raw tags protect f1
    let mut fs = mount(&img);
    put(&mut fs, "/a/b/f2", &body);
    let f2 = fs.file_map("/a/b/f2").unwrap();

    // allocator picks (inode slots are deterministic, not allocated) must
    // all have dodged /a/f1's raw tags despite the empty tracker
    let taken: std::collections::HashSet<u64> =
        f1.inodes.iter().chain(f1.chains.iter().flatten()).copied().collect();
    for idx in f2.chains.iter().flatten() {
        assert!(!taken.contains(idx), "block {} stolen from /a/f1", idx);
    }
    assert_eq!(get(&mut fs, "/a/f1"), body);
}

#[test]
fn geometry_round_trips_through_mount() {
    let t = TempDir::new().unwrap();
    for (name, size, blocksize, duplication) in
        [("a", 4 * MB, 2048u32, 2u32), ("b", 8 * MB, 4096, 5)]
    {
        let p = t.path().join(name);
        let opts = MkfsOptions {
            size,
            blocksize,
            duplication,
            kdf_iterations: KDF,
            ..MkfsOptions::default()
        };
        make_image(&p, &opts).expect("mkfs");
        let mut fs = mount(&p);
        let info = fs.info();
        assert_eq!(info.blocksize, blocksize);
        assert_eq!(info.blocks, size / blocksize as u64);
        assert_eq!(info.duplication, duplication);
        assert_eq!(info.version, "202X.XX");
        assert_eq!(info.cipher, "AES256");

        // the engine works at this geometry too
        let body = pattern(3 * blocksize as usize);
        put(&mut fs, "/x/y:z", &body);
        assert_eq!(get(&mut fs, "/x/y:z"), body);
    }
}

#[test]
fn truncate_grows_with_zeros_and_shrinks_chains() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 2);
    let mut fs = mount(&img);
    let body = pattern(2500);
    put(&mut fs, "/t/file", &body);

    fs.truncate("/t/file", 4000).unwrap();
    let grown = get(&mut fs, "/t/file");
    assert_eq!(grown.len(), 4000);
    assert_eq!(&grown[..2500], &body[..]);
    assert!(grown[2500..].iter().all(|b| *b == 0));

    fs.truncate("/t/file", 100).unwrap();
    assert_eq!(get(&mut fs, "/t/file"), &body[..100]);
    let map = fs.file_map("/t/file").unwrap();
    assert!(map.chains.iter().all(Vec::is_empty), "shrunk into the header");
}

#[test]
fn bloc_view_lists_owned_blocks() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 2);
    let opts = MountOptions { show_bloc: true, ..MountOptions::default() };
    let mut fs = StegFs::mount(&img, opts).unwrap();

    put(&mut fs, "/w/f", &pattern(3000));
    assert!(fs.readdir("/").unwrap().contains(&"bloc".to_owned()));
    let entries = fs.readdir("/bloc").unwrap();
    // two inodes and two single-block chains
    assert_eq!(entries.len(), 4);
    for e in &entries {
        let attr = fs.stat(&format!("/bloc/{}", e)).unwrap();
        assert_eq!(attr.kind, stegfs::NodeKind::Link);
        assert_eq!(fs.readlink(&format!("/bloc/{}", e)).unwrap(), "../w/f");
    }
}

#[test]
fn wrong_node_kinds_are_rejected() {
    let t = TempDir::new().unwrap();
    let img = image(&t, "img", 4 * MB, 2);
    let mut fs = mount(&img);

    assert!(matches!(fs.open("/", OpenFlags::READ), Err(Error::IsDir)));
    fs.mkdir("/d").unwrap();
    assert!(matches!(fs.open("/d", OpenFlags::READ), Err(Error::IsDir)));
    assert!(matches!(fs.unlink("/d"), Err(Error::IsDir)));

    put(&mut fs, "/f", b"x");
    assert!(matches!(fs.rmdir("/f"), Err(Error::NotDir)));
    assert!(matches!(fs.readdir("/f"), Err(Error::NotDir)));

    put(&mut fs, "/d/inner", b"x");
    assert!(matches!(fs.rmdir("/d"), Err(Error::DirNotEmpty)));
    fs.unlink("/d/inner").unwrap();
    fs.rmdir("/d").unwrap();
}

#[test]
fn junk_files_do_not_mount() {
    let t = TempDir::new().unwrap();
    let junk = t.path().join("junk");
    fs::write(&junk, vec![0x42u8; 64 * 1024]).unwrap();
    assert!(matches!(
        StegFs::mount(&junk, MountOptions::default()),
        Err(Error::NotStegfs)
    ));

    let tiny = t.path().join("tiny");
    fs::write(&tiny, vec![0u8; 512]).unwrap();
    assert!(matches!(
        StegFs::mount(&tiny, MountOptions::default()),
        Err(Error::NotStegfs)
    ));
}
