//! Steganographic block file system core. Four layers:
//!   + Image: an mmap-backed block store where every block, used or free,
//!     is indistinguishable from CSPRNG noise.
//!   + Blocks: the codec (path tag, payload hash, chained encryption), the
//!     probabilistic allocator, and the advisory in-use tracker.
//!   + Files: N-way redundant block chains whose keys, IVs, and inode
//!     placement all derive from `(directory, name, passphrase)`.
//!   + Cache: the client-side directory tree; the disk stores no listings.
//!
//! Every operation here is synchronous and the whole object is
//! single-writer: a host layer (FUSE shim or otherwise) must serialize its
//! calls.

use std::path::Path as OsPath;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use itertools::izip;

use crate::crypto;
use crate::error::{Error, Result};
use crate::param::{
    BLOCK_SIZE, COPIES_DEFAULT, HEAD_OFFSET, KDF_ITERATIONS, MAC_SIZE, NEXT_SIZE, TAG_SIZE,
};

mod alloc;
mod block;
mod cache;
mod keys;
pub mod path;
mod superblock;

pub use superblock::Superblock;

use alloc::BlockMap;
use block::{get_be64, set_be64, Block, BlockDev, BlockRead, Image};
use cache::{Cache, FileEntry};
use keys::FileKeys;

bitflags! {
    /// How the host layer opened a file.
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
    }
}

/// Mount-time options. In paranoid mode the superblock is neither read nor
/// checked and every parameter comes from here.
#[derive(Clone)]
pub struct MountOptions {
    pub paranoid: bool,
    pub cipher: String,
    pub mode: String,
    pub hash: String,
    pub mac: String,
    pub kdf_iterations: u64,
    pub duplication: u32,
    pub blocksize: u32,
    pub head_offset: u32,
    pub show_bloc: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            paranoid: false,
            cipher: crypto::CIPHER_NAME.to_owned(),
            mode: crypto::MODE_NAME.to_owned(),
            hash: crypto::HASH_NAME.to_owned(),
            mac: crypto::MAC_NAME.to_owned(),
            kdf_iterations: KDF_ITERATIONS,
            duplication: COPIES_DEFAULT,
            blocksize: BLOCK_SIZE as u32,
            head_offset: HEAD_OFFSET,
            show_bloc: false,
        }
    }
}

/// What a node is, as reported by [`StegFs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    /// A `/bloc/<index>` diagnostic entry.
    Link,
}

/// Attributes of one node.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: u64,
    pub nlink: u32,
    /// Normalized index of the first inode block, as an inode-number hint.
    pub inode: u64,
}

impl Attr {
    fn directory(size: u64) -> Self {
        Self { kind: NodeKind::Directory, size, mtime: now(), nlink: 2, inode: 0 }
    }
}

/// A snapshot of file-system wide facts.
#[derive(Debug, Clone)]
pub struct Info {
    /// Image size in bytes.
    pub size: u64,
    pub blocks: u64,
    pub blocks_used: u64,
    pub blocksize: u32,
    pub head_offset: u32,
    pub duplication: u32,
    pub cipher: String,
    pub mode: String,
    pub hash: String,
    pub mac: String,
    pub version: String,
    pub show_bloc: bool,
}

/// Where one file physically lives: normalized block indices, for
/// diagnostics and tests. Obtaining this proves the file exists.
#[derive(Debug, Clone)]
pub struct FileMap {
    pub inodes: Vec<u64>,
    pub chains: Vec<Vec<u64>>,
}

/// A mounted file system.
pub struct StegFs {
    dev: BlockDev,
    sb: Superblock,
    map: BlockMap,
    cache: Cache,
    show_bloc: bool,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The path tag shared by every block of a file under `dir`. Files in the
/// root get no tag at all: their blocks carry noise there.
fn dir_tag(dir: &str) -> Option<[u8; TAG_SIZE]> {
    if dir == "/" {
        None
    } else {
        Some(crypto::hash(&[dir.as_bytes()]))
    }
}

impl StegFs {
    /// Open, lock, and map an image, then recognize (or, in paranoid mode,
    /// assume) its parameters.
    pub fn mount(image: &OsPath, opts: MountOptions) -> Result<Self> {
        let image = Image::open(image)?;
        let sb = if opts.paranoid {
            if !crypto::suite_supported(&opts.cipher, &opts.mode, &opts.hash, &opts.mac) {
                return Err(Error::InvalidTag("CIPHER"));
            }
            let mut sb = Superblock::with_defaults(
                opts.blocksize,
                opts.duplication,
                opts.kdf_iterations,
                image.len() / opts.blocksize as u64,
            );
            sb.head_offset = opts.head_offset;
            sb.validate(image.len())?;
            sb
        } else {
            Superblock::read(image.bytes(), image.len())?
        };

        let dev = BlockDev::new(image, sb.blocksize);
        let mut map = BlockMap::new(dev.blocks(), opts.show_bloc);
        let _ = map.set(0, None); // the superblock is always in use
        let mut cache = Cache::new();
        if opts.show_bloc {
            let _ = cache.make_dir(&format!("/{}", crate::param::BLOC_DIR));
        }
        log::debug!(
            "mounted {} blocks of {} bytes, duplication {}",
            dev.blocks(),
            sb.blocksize,
            sb.copies,
        );
        Ok(Self { dev, sb, map, cache, show_bloc: opts.show_bloc })
    }

    /// Flush and drop. The lock dies with the descriptor; the cache (and
    /// with it every directory that holds no file) dies with the mount.
    pub fn unmount(self) -> Result<()> {
        self.dev.flush()
    }

    pub fn info(&self) -> Info {
        Info {
            size: self.dev.image_len(),
            blocks: self.dev.blocks(),
            blocks_used: self.map.used(),
            blocksize: self.sb.blocksize,
            head_offset: self.sb.head_offset,
            duplication: self.sb.copies,
            cipher: self.sb.cipher.clone(),
            mode: self.sb.mode.clone(),
            hash: self.sb.hash.clone(),
            mac: self.sb.mac.clone(),
            version: self.sb.version.clone(),
            show_bloc: self.show_bloc,
        }
    }

    /// Cheap pre-flight for the host layer's write path.
    pub fn will_fit(&self, size: u64) -> Result<()> {
        let needed = (self.sb.chain_len(size) + 1) * self.sb.copies as u64;
        if needed > self.dev.blocks() - 1 {
            return Err(Error::TooLarge);
        }
        if needed > self.dev.blocks() - self.map.used() {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // host-facing operations; paths are `/dir/name[:passphrase]`
    // ------------------------------------------------------------------

    /// Add a file to the cache without touching the disk. No inode exists
    /// until the first flush.
    pub fn create(&mut self, p: &str, writable: bool) -> Result<()> {
        let (dir, name, pass) = path::split(p);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        let mut f = FileEntry::new(dir, name, pass);
        f.writable = writable;
        f.time = now();
        f.data = Some(Vec::new());
        self.cache.put(f);
        Ok(())
    }

    /// Attributes of a path. Consults the cache first; on a miss (or a
    /// passphrase mismatch) the disk is asked, and a hit implicitly
    /// materializes the directory chain above the file.
    pub fn stat(&mut self, p: &str) -> Result<Attr> {
        if p == "/" {
            return Ok(Attr::directory(self.dev.image_len()));
        }
        if let Some(attr) = self.bloc_stat(p)? {
            return Ok(attr);
        }
        let (dir, name, pass) = path::split(p);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        let plain = path::without_password(p);
        if let Some(node) = self.cache.lookup(plain) {
            match &node.file {
                None => return Ok(Attr::directory(0)),
                Some(f) if f.pass == pass => {
                    return Ok(Attr {
                        kind: NodeKind::File,
                        size: f.size,
                        mtime: f.time,
                        nlink: 1,
                        inode: f.inodes.first().map_or(0, |&i| self.dev.normalize(i)),
                    });
                }
                // wrong passphrase: let the disk (not) confirm
                Some(_) => {}
            }
        }
        let mut f = FileEntry::new(dir, name, pass);
        self.file_stat(&mut f, false)?;
        let attr = Attr {
            kind: NodeKind::File,
            size: f.size,
            mtime: f.time,
            nlink: 1,
            inode: f.inodes.first().map_or(0, |&i| self.dev.normalize(i)),
        };
        self.cache.put(f);
        Ok(attr)
    }

    /// Children of a directory, from the cache alone: the disk carries no
    /// listing to scan. Unknown directories read as empty, which is
    /// indistinguishable from nonexistent by design.
    pub fn readdir(&self, p: &str) -> Result<Vec<String>> {
        if self.show_bloc && p == self.bloc_root() {
            return Ok(self.map.owned().iter().map(|(i, _)| i.to_string()).collect());
        }
        match self.cache.readdir(p) {
            Some(names) => Ok(names),
            None => match self.cache.lookup(p) {
                Some(_) => Err(Error::NotDir),
                None => Ok(Vec::new()),
            },
        }
    }

    /// Directories are a cache-only fiction; this one exists until unmount
    /// unless a file beneath it makes it real.
    pub fn mkdir(&mut self, p: &str) -> Result<()> {
        if let Some(node) = self.cache.lookup(p) {
            if !node.is_dir() {
                return Err(Error::NotDir);
            }
            return Ok(());
        }
        let _ = self.cache.make_dir(p);
        Ok(())
    }

    pub fn rmdir(&mut self, p: &str) -> Result<()> {
        if p == "/" || (self.show_bloc && p == self.bloc_root()) {
            return Err(Error::Denied);
        }
        let node = self.cache.lookup(p).ok_or(Error::NotFound)?;
        if !node.is_dir() {
            return Err(Error::NotDir);
        }
        if !node.children.is_empty() {
            return Err(Error::DirNotEmpty);
        }
        let _ = self.cache.remove(p);
        Ok(())
    }

    /// Open a file: load its payload into the cache (existing files), or
    /// create it (CREATE + WRITE).
    pub fn open(&mut self, p: &str, flags: OpenFlags) -> Result<()> {
        if p == "/" {
            return Err(Error::IsDir);
        }
        let (dir, name, pass) = path::split(p);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        let plain = path::without_password(p);
        if let Some(node) = self.cache.lookup(plain) {
            if node.is_dir() {
                return Err(Error::IsDir);
            }
        }

        let cached = match self.cache.take(dir, name) {
            Some(f) if f.pass == pass => Some(f),
            Some(f) => {
                // wrong passphrase: leave the entry alone, ask the disk
                self.cache.put(f);
                None
            }
            None => None,
        };

        let mut f = match cached {
            Some(mut f) => {
                if f.data.is_none() {
                    // known but unloaded (e.g. found by an earlier stat)
                    if let Err(e) = self.file_read(&mut f) {
                        self.cache.put(f);
                        return Err(e);
                    }
                }
                f
            }
            None => {
                let mut f = FileEntry::new(dir, name, pass);
                match self.file_read(&mut f) {
                    Ok(()) => f,
                    Err(Error::NotFound)
                        if flags.contains(OpenFlags::CREATE | OpenFlags::WRITE) =>
                    {
                        f.time = now();
                        f.size = 0;
                        f.data = Some(Vec::new());
                        f
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        f.writable = flags.contains(OpenFlags::WRITE);
        if flags.contains(OpenFlags::TRUNCATE) {
            f.data = Some(Vec::new());
            f.size = 0;
            f.dirty = true;
        }
        self.cache.put(f);
        Ok(())
    }

    /// Bytes `[offset, offset + size)` of an opened file, clamped to its
    /// length. Served from the cache; a file written this mount reads back
    /// exactly as written without touching the disk.
    pub fn read(&mut self, p: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let (_, _, pass) = path::split(p);
        let has_data = match self.cache.lookup(path::without_password(p)) {
            Some(node) if node.is_dir() => return Err(Error::IsDir),
            Some(node) => node.file.as_ref().map_or(false, |f| f.data.is_some() && f.pass == pass),
            None => false,
        };
        if !has_data {
            self.open(p, OpenFlags::READ)?;
        }
        let f = self
            .cache
            .lookup(path::without_password(p))
            .and_then(|n| n.file.as_ref())
            .ok_or(Error::NotFound)?;
        let data = f.data.as_ref().ok_or(Error::NotFound)?;
        let start = (offset as usize).min(data.len());
        let end = (offset as usize).saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Append or overwrite bytes in an opened file's buffer. Nothing is
    /// flushed until release.
    pub fn write(&mut self, p: &str, offset: u64, buf: &[u8]) -> Result<usize> {
        let new_end = offset as usize + buf.len();
        let (_, name, pass) = path::split(p);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        {
            let node = self
                .cache
                .lookup(path::without_password(p))
                .ok_or(Error::NotFound)?;
            let f = node.file.as_ref().ok_or(Error::IsDir)?;
            if f.pass != pass || !f.writable {
                return Err(Error::Denied);
            }
            let grown = new_end.max(f.data.as_ref().map_or(0, Vec::len));
            self.will_fit(grown as u64)?;
        }
        let f = self
            .cache
            .lookup_mut(path::without_password(p))
            .and_then(|n| n.file.as_mut())
            .ok_or(Error::NotFound)?;
        let data = f.data.get_or_insert_with(Vec::new);
        if new_end > data.len() {
            data.resize(new_end, 0);
        }
        data[offset as usize..new_end].copy_from_slice(buf);
        f.size = data.len() as u64;
        f.dirty = true;
        Ok(buf.len())
    }

    /// Flush a dirty file to disk: N inode blocks, N data chains, one MAC.
    pub fn release(&mut self, p: &str) -> Result<()> {
        let (dir, name, pass) = path::split(p);
        let mut f = match self.cache.take(dir, name) {
            Some(f) => f,
            None => return Ok(()),
        };
        if f.pass != pass || !f.dirty {
            self.cache.put(f);
            return Ok(());
        }
        match self.file_write(&mut f) {
            Ok(()) => {
                f.dirty = false;
                self.cache.put(f);
                Ok(())
            }
            Err(e) => {
                self.cache.put(f);
                Err(e)
            }
        }
    }

    /// Resize a file, zero-filling any growth, and flush immediately.
    pub fn truncate(&mut self, p: &str, size: u64) -> Result<()> {
        self.will_fit(size)?;
        self.open(p, OpenFlags::READ | OpenFlags::WRITE)?;
        let (dir, name, _) = path::split(p);
        let mut f = self.cache.take(dir, name).ok_or(Error::NotFound)?;
        f.data.get_or_insert_with(Vec::new).resize(size as usize, 0);
        f.size = size;
        let out = self.file_write(&mut f);
        f.dirty = out.is_err();
        self.cache.put(f);
        out
    }

    /// Scrub every block of every copy back to noise and forget the file.
    pub fn unlink(&mut self, p: &str) -> Result<()> {
        if self.show_bloc && p.starts_with(&(self.bloc_root() + "/")) {
            return Err(Error::Denied);
        }
        let (dir, name, pass) = path::split(p);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        let plain = path::without_password(p);
        if let Some(node) = self.cache.lookup(plain) {
            if node.is_dir() {
                return Err(Error::IsDir);
            }
        }
        let had_cache = self.cache.lookup(plain).is_some();
        let mut f = FileEntry::new(dir, name, pass);
        match self.file_delete(&mut f) {
            Ok(()) => {
                let _ = self.cache.remove(plain);
                Ok(())
            }
            Err(Error::NotFound) if had_cache => {
                // never flushed; it only ever existed in the cache
                let _ = self.cache.remove(plain);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Target of a `/bloc/<index>` entry.
    pub fn readlink(&self, p: &str) -> Result<String> {
        let rest = p
            .strip_prefix(&(self.bloc_root() + "/"))
            .filter(|_| self.show_bloc)
            .ok_or(Error::NotFound)?;
        let id: u64 = rest.parse().map_err(|_| Error::NotFound)?;
        match self.map.owner(id) {
            Some(owner) => Ok(format!("..{}", owner)),
            None => Err(Error::NotFound),
        }
    }

    /// Physical location of a file, as proof of existence and for tests.
    pub fn file_map(&mut self, p: &str) -> Result<FileMap> {
        let (dir, name, pass) = path::split(p);
        let mut f = FileEntry::new(dir, name, pass);
        self.file_stat(&mut f, false)?;
        let map = FileMap {
            inodes: f.inodes.iter().map(|&i| self.dev.normalize(i)).collect(),
            chains: f
                .chains
                .iter()
                .map(|c| c.iter().map(|&b| self.dev.normalize(b)).collect())
                .collect(),
        };
        self.cache.put(f);
        Ok(map)
    }

    fn bloc_root(&self) -> String {
        format!("/{}", crate::param::BLOC_DIR)
    }

    fn bloc_stat(&self, p: &str) -> Result<Option<Attr>> {
        if !self.show_bloc {
            return Ok(None);
        }
        if let Some(rest) = p.strip_prefix(&(self.bloc_root() + "/")) {
            let id: u64 = rest.parse().map_err(|_| Error::NotFound)?;
            return match self.map.owner(id) {
                Some(owner) => Ok(Some(Attr {
                    kind: NodeKind::Link,
                    size: owner.len() as u64 + 2,
                    mtime: now(),
                    nlink: 1,
                    inode: id,
                })),
                None => Err(Error::NotFound),
            };
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // the file engine
    // ------------------------------------------------------------------

    /// Find a file on disk: place its inode candidates, decrypt whichever
    /// respond, and walk every copy's chain. With `quick` the scan stops
    /// once one inode's chains have been walked.
    ///
    /// Success needs at least one live inode and at least one complete
    /// chain. On failure every block this call marked in-use is unmarked.
    fn file_stat(&mut self, f: &mut FileEntry, quick: bool) -> Result<()> {
        let copies = self.sb.copies as usize;
        f.inodes = keys::inode_candidates(&f.dir, &f.name, self.sb.copies);
        f.chains = vec![Vec::new(); copies];
        let keys = FileKeys::derive(&f.dir, &f.name, &f.pass, self.sb.copies, self.sb.kdf_iterations);
        let tag = dir_tag(&f.dir);
        let owner = f.path();
        let owner = if self.show_bloc { Some(owner.as_str()) } else { None };

        let mut available = copies;
        let mut corrupt = 0usize;
        let mut walked = false;
        let mut claimed: Vec<u64> = Vec::new();

        for i in 0..copies {
            let mut dec = keys.decryptor(i);
            let inode = match self.dev.read(f.inodes[i], tag.as_ref(), &mut dec) {
                BlockRead::Valid(b) => b,
                _ => {
                    available -= 1;
                    continue;
                }
            };
            let size = inode.next();
            if size > self.dev.image_len() {
                // a decrypting block with an impossible size is corrupt
                available -= 1;
                continue;
            }
            let norm = self.dev.normalize(f.inodes[i]);
            if self.map.set(norm, owner) {
                claimed.push(norm);
            }
            if walked {
                continue; // availability scan only; the chains are known
            }

            f.size = size;
            f.time = get_be64(inode.data(), 0);
            let nblocks = self.sb.chain_len(size) as usize;
            for j in 0..copies {
                let mut dec = keys.decryptor(j);
                let mut cur = get_be64(inode.data(), (1 + j) * NEXT_SIZE);
                for _ in 0..nblocks {
                    match self.dev.read(cur, tag.as_ref(), &mut dec) {
                        BlockRead::Valid(b) => {
                            f.chains[j].push(cur);
                            let norm = self.dev.normalize(cur);
                            if self.map.set(norm, owner) {
                                claimed.push(norm);
                            }
                            cur = b.next();
                        }
                        _ => {
                            corrupt += 1;
                            break;
                        }
                    }
                }
            }
            walked = true;
            if quick {
                break;
            }
        }

        if available >= 1 && corrupt < copies {
            Ok(())
        } else {
            for id in claimed {
                self.map.clear(id);
            }
            Err(Error::NotFound)
        }
    }

    /// Read a file's payload into `f.data`, verifying the chain MAC. The
    /// first copy whose chain decrypts *and* matches the MAC wins; a copy
    /// that decrypts to different bytes than copy 0 wrote cannot match.
    fn file_read(&mut self, f: &mut FileEntry) -> Result<()> {
        self.file_stat(f, true)?;
        let copies = self.sb.copies as usize;
        let keys = FileKeys::derive(&f.dir, &f.name, &f.pass, self.sb.copies, self.sb.kdf_iterations);
        let tag = dir_tag(&f.dir);
        let head_cap = self.sb.head_capacity();
        let data_size = self.sb.data_size();
        let mac_off = (copies + 1) * NEXT_SIZE;

        // the in-inode payload prefix and the stored MAC
        let mut head = None;
        for i in 0..copies {
            let mut dec = keys.decryptor(i);
            if let BlockRead::Valid(b) = self.dev.read(f.inodes[i], tag.as_ref(), &mut dec) {
                let take = (f.size as usize).min(head_cap);
                let mut mac = [0u8; MAC_SIZE];
                mac.copy_from_slice(&b.data()[mac_off..mac_off + MAC_SIZE]);
                head = Some((b.data()[self.sb.head_offset as usize..][..take].to_vec(), mac));
                break;
            }
        }
        let (head, stored_mac) = head.ok_or(Error::NotFound)?;

        let nblocks = self.sb.chain_len(f.size) as usize;
        for j in 0..copies {
            if f.chains[j].len() != nblocks {
                continue; // this copy is corrupt; try the next
            }
            let mut dec = keys.decryptor(j);
            let mut mac = keys.mac_stream();
            let mut data = head.clone();
            data.reserve(f.size as usize - data.len());
            let mut complete = true;
            for (k, &bid) in f.chains[j].iter().enumerate() {
                match self.dev.read(bid, tag.as_ref(), &mut dec) {
                    BlockRead::Valid(b) => {
                        let start = head_cap + k * data_size;
                        let take = data_size.min(f.size as usize - start);
                        data.extend_from_slice(&b.data()[..take]);
                        mac.update(b.data());
                    }
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            if !mac.verify(&stored_mac) {
                log::warn!("chain MAC mismatch on copy {}", j);
                continue;
            }
            f.data = Some(data);
            return Ok(());
        }
        Err(Error::IntegrityFailure)
    }

    /// Write a file: allocate (or reuse) N chains, rewrite them whole,
    /// then the N inode blocks. Copy 0's plaintext stream is MACed and the
    /// tag stored in every inode.
    fn file_write(&mut self, f: &mut FileEntry) -> Result<()> {
        let size = f.data.as_ref().map_or(0, |d| d.len()) as u64;
        self.will_fit(size)?;

        let existed = self.file_stat(f, true).is_ok();
        f.size = size; // stat resets size to what the disk last knew
        f.time = now();
        if !existed {
            f.chains = vec![Vec::new(); self.sb.copies as usize];
        }

        let copies = self.sb.copies as usize;
        let nblocks = self.sb.chain_len(size) as usize;
        let keys = FileKeys::derive(&f.dir, &f.name, &f.pass, self.sb.copies, self.sb.kdf_iterations);
        let tag = dir_tag(&f.dir);
        let owner = f.path();
        let owner = if self.show_bloc { Some(owner.as_str()) } else { None };
        let mut claimed: Vec<u64> = Vec::new();

        // claim the deterministic inode slots (never re-randomized)
        for i in 0..copies {
            let norm = self.dev.normalize(f.inodes[i]);
            if self.map.set(norm, owner) {
                claimed.push(norm);
            }
        }

        // grow or shrink every copy's chain to the required length
        for j in 0..copies {
            while f.chains[j].len() < nblocks {
                match alloc::assign(&self.dev, &mut self.map, &f.dir, owner) {
                    Some(id) => {
                        claimed.push(self.dev.normalize(id));
                        f.chains[j].push(id);
                    }
                    None => {
                        for id in claimed {
                            self.map.clear(id);
                        }
                        return Err(Error::NoSpace);
                    }
                }
            }
            for &id in f.chains[j].get(nblocks..).unwrap_or(&[]) {
                self.dev.scrub(id);
                self.map.clear(self.dev.normalize(id));
            }
            f.chains[j].truncate(nblocks);
        }

        // data chains first; an interrupted write must leave only what
        // looks like free space
        let payload = f.data.as_deref().unwrap_or(&[]);
        let head_cap = self.sb.head_capacity();
        let data_size = self.sb.data_size();
        let blocksize = self.sb.blocksize as usize;
        let mut chain_mac = [0u8; MAC_SIZE];
        for j in 0..copies {
            let mut enc = keys.encryptor(j);
            let mut mac = if j == 0 { Some(keys.mac_stream()) } else { None };
            for k in 0..nblocks {
                let mut block = Block::noise(blocksize);
                let start = head_cap + k * data_size;
                let take = data_size.min(size as usize - start);
                block.data_mut()[..take].copy_from_slice(&payload[start..start + take]);
                // the tail past EOF must be identical on every copy, or no
                // copy but 0 could ever match the MAC
                block.data_mut()[take..].fill(0);
                if k + 1 < nblocks {
                    block.set_next(f.chains[j][k + 1]);
                }
                if let Some(m) = mac.as_mut() {
                    m.update(block.data());
                }
                if let Err(e) = self.dev.write(f.chains[j][k], block, tag.as_ref(), &mut enc) {
                    self.scrub_file(f);
                    return Err(e);
                }
            }
            if let Some(m) = mac {
                chain_mac = m.finalize();
            }
        }

        // then the inode blocks: identical plaintext, per-copy ciphertext
        let mut inode_data = vec![0u8; data_size];
        crypto::fill_random(&mut inode_data);
        set_be64(&mut inode_data, 0, f.time);
        if nblocks > 0 {
            for j in 0..copies {
                set_be64(&mut inode_data, (1 + j) * NEXT_SIZE, f.chains[j][0]);
            }
        }
        let mac_off = (copies + 1) * NEXT_SIZE;
        inode_data[mac_off..mac_off + MAC_SIZE].copy_from_slice(&chain_mac);
        let take = (size as usize).min(head_cap);
        let head_off = self.sb.head_offset as usize;
        inode_data[head_off..head_off + take].copy_from_slice(&payload[..take]);

        for i in 0..copies {
            let mut enc = keys.encryptor(i);
            let mut block = Block::noise(blocksize);
            block.data_mut().copy_from_slice(&inode_data);
            block.set_next(size);
            if let Err(e) = self.dev.write(f.inodes[i], block, tag.as_ref(), &mut enc) {
                self.scrub_file(f);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stat (all copies), then return every block the file occupies to
    /// noise.
    fn file_delete(&mut self, f: &mut FileEntry) -> Result<()> {
        self.file_stat(f, false)?;
        self.scrub_file(f);
        Ok(())
    }

    /// Scrub every inode and chain block of `f` and drop their tracker
    /// marks.
    fn scrub_file(&mut self, f: &FileEntry) {
        for (&inode, chain) in izip!(&f.inodes, &f.chains) {
            self.dev.scrub(inode);
            self.map.clear(self.dev.normalize(inode));
            for &id in chain {
                self.dev.scrub(id);
                self.map.clear(self.dev.normalize(id));
            }
        }
    }
}
