// SPDX-License-Identifier: Apache-2.0

//! Enclave filesystem
//!
//! An in-memory tree of directories and files living entirely inside the enclave. File
//! contents are kept in fixed-size blocks, which pass through a [`Sealer`] on their way in
//! and out, so the cipher stays pluggable.

use super::{Backend, DirEntry, Device};
use crate::mount;
use crate::table::DEVID_ENCLAVE_FILESYSTEM;

use core::ffi::c_int;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use libc::{
    mode_t, off_t, EBADF, EBUSY, EEXIST, EFBIG, EINVAL, EISDIR, ENAMETOOLONG, ENOENT, ENOTDIR,
    ENOTEMPTY, EOVERFLOW, EPERM, O_ACCMODE, O_APPEND, O_CREAT, O_DIRECTORY, O_EXCL, O_RDONLY,
    O_TRUNC, O_WRONLY, SEEK_CUR, SEEK_END, SEEK_SET,
};
use postern::item::fs::Stat;
use postern::Result;
use spin::Mutex;

/// Size of a sealed block.
pub const BLOCK_SIZE: usize = 4096;

/// Largest supported file size.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

/// Longest name of a directory entry.
pub const NAME_MAX: usize = 255;

const ROOT_INO: u64 = 1;

/// Protects file blocks at rest.
pub trait Sealer: Send + Sync {
    /// Seals block `index` of inode `ino` in place.
    fn seal(&self, ino: u64, index: u64, block: &mut [u8]);

    /// Unseals block `index` of inode `ino` in place.
    ///
    /// Fails with `EIO` if the block does not authenticate.
    fn unseal(&self, ino: u64, index: u64, block: &mut [u8]) -> Result<()>;
}

/// Keeps blocks in the clear.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSealer;

impl Sealer for NullSealer {
    fn seal(&self, _: u64, _: u64, _: &mut [u8]) {}

    fn unseal(&self, _: u64, _: u64, _: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Time {
    sec: i64,
    nsec: i64,
}

impl Time {
    fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: i64::try_from(now.as_secs()).unwrap_or(i64::MAX),
            nsec: now.subsec_nanos().into(),
        }
    }
}

fn stat(ino: u64, mode: mode_t, nlink: u32, size: u64, mtime: Time) -> Stat {
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    Stat {
        dev: DEVID_ENCLAVE_FILESYSTEM,
        ino,
        mode,
        nlink,
        size,
        blksize: BLOCK_SIZE as _,
        blocks: size.saturating_add(511) / 512,
        atime: mtime.sec,
        atime_nsec: mtime.nsec,
        mtime: mtime.sec,
        mtime_nsec: mtime.nsec,
        ctime: mtime.sec,
        ctime_nsec: mtime.nsec,
        ..Default::default()
    }
}

struct Inode {
    ino: u64,
    mode: mode_t,
    nlink: u32,
    size: u64,
    blocks: Vec<Vec<u8>>,
    mtime: Time,
}

impl Inode {
    fn block(&self, sealer: &dyn Sealer, index: usize) -> Result<Vec<u8>> {
        let mut block = self.blocks[index].clone();
        sealer.unseal(self.ino, index as u64, &mut block)?;
        Ok(block)
    }

    fn store(&mut self, sealer: &dyn Sealer, index: usize, mut block: Vec<u8>) {
        sealer.seal(self.ino, index as u64, &mut block);
        self.blocks[index] = block;
    }

    fn read_at(&self, sealer: &dyn Sealer, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = usize::try_from(self.size - offset).map_or(buf.len(), |n| n.min(buf.len()));

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let index = (pos / BLOCK_SIZE as u64) as usize;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - within).min(len - done);
            let block = self.block(sealer, index)?;
            buf[done..done + n].copy_from_slice(&block[within..within + n]);
            done += n;
        }
        Ok(len)
    }

    fn write_at(&mut self, sealer: &dyn Sealer, offset: u64, buf: &[u8]) -> Result<usize> {
        let end = offset.checked_add(buf.len() as u64).ok_or(EFBIG)?;
        if end > self.size {
            self.resize(sealer, end)?;
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = (pos / BLOCK_SIZE as u64) as usize;
            let within = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - within).min(buf.len() - done);
            let mut block = self.block(sealer, index)?;
            block[within..within + n].copy_from_slice(&buf[done..done + n]);
            self.store(sealer, index, block);
            done += n;
        }
        self.mtime = Time::now();
        Ok(buf.len())
    }

    /// Grows with zeroes or shrinks to `size` bytes.
    fn resize(&mut self, sealer: &dyn Sealer, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(EFBIG);
        }
        let count = size.div_ceil(BLOCK_SIZE as u64) as usize;

        if size < self.size {
            self.blocks.truncate(count);
            let tail = (size % BLOCK_SIZE as u64) as usize;
            if tail != 0 {
                let mut block = self.block(sealer, count - 1)?;
                block[tail..].fill(0);
                self.store(sealer, count - 1, block);
            }
        }
        while self.blocks.len() < count {
            let index = self.blocks.len();
            let mut block = vec![0; BLOCK_SIZE];
            sealer.seal(self.ino, index as u64, &mut block);
            self.blocks.push(block);
        }

        self.size = size;
        self.mtime = Time::now();
        Ok(())
    }

    fn stat(&self) -> Stat {
        stat(self.ino, libc::S_IFREG | self.mode, self.nlink, self.size, self.mtime)
    }
}

struct Directory {
    parent: u64,
    mode: mode_t,
    entries: BTreeMap<String, u64>,
    mtime: Time,
}

enum Node {
    Dir(Directory),
    File(Arc<Mutex<Inode>>),
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next: u64,
}

impl Tree {
    fn new() -> Self {
        let root = Directory {
            parent: ROOT_INO,
            mode: 0o755,
            entries: BTreeMap::new(),
            mtime: Time::now(),
        };
        Self {
            nodes: HashMap::from([(ROOT_INO, Node::Dir(root))]),
            next: ROOT_INO + 1,
        }
    }

    fn dir(&self, ino: u64) -> Result<&Directory> {
        match self.nodes.get(&ino) {
            Some(Node::Dir(dir)) => Ok(dir),
            Some(Node::File(_)) => Err(ENOTDIR),
            None => Err(ENOENT),
        }
    }

    fn dir_mut(&mut self, ino: u64) -> Result<&mut Directory> {
        match self.nodes.get_mut(&ino) {
            Some(Node::Dir(dir)) => Ok(dir),
            Some(Node::File(_)) => Err(ENOTDIR),
            None => Err(ENOENT),
        }
    }

    fn is_dir(&self, ino: u64) -> bool {
        matches!(self.nodes.get(&ino), Some(Node::Dir(_)))
    }

    fn lookup(&self, root: u64, path: &str) -> Result<u64> {
        let mut ino = root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            ino = *self.dir(ino)?.entries.get(segment).ok_or(ENOENT)?;
        }
        Ok(ino)
    }

    /// Splits `path` into its existing parent directory and final name.
    ///
    /// The name is empty if `path` refers to `root` itself.
    fn entry<'p>(&self, root: u64, path: &'p str) -> Result<(u64, &'p str)> {
        let (parent, name) = mount::split(path);
        if name.is_empty() {
            return Ok((root, ""));
        }
        if name.len() > NAME_MAX {
            return Err(ENAMETOOLONG);
        }
        let parent = self.lookup(root, parent)?;
        self.dir(parent)?;
        Ok((parent, name))
    }

    fn child(&self, parent: u64, name: &str) -> Option<u64> {
        self.dir(parent).ok()?.entries.get(name).copied()
    }

    fn insert(&mut self, parent: u64, name: &str, node: Node) -> Result<u64> {
        let ino = self.next;
        let dir = self.dir_mut(parent)?;
        dir.entries.insert(name.into(), ino);
        dir.mtime = Time::now();
        self.nodes.insert(ino, node);
        self.next += 1;
        Ok(ino)
    }

    fn unlink_entry(&mut self, parent: u64, name: &str) -> Result<()> {
        let dir = self.dir_mut(parent)?;
        dir.entries.remove(name);
        dir.mtime = Time::now();
        Ok(())
    }

    /// Drops one link to `ino`, removing the node once nothing refers to it.
    ///
    /// Open files keep their inode alive.
    fn drop_link(&mut self, ino: u64) {
        let remove = match self.nodes.get(&ino) {
            Some(Node::File(inode)) => {
                let mut inode = inode.lock();
                inode.nlink = inode.nlink.saturating_sub(1);
                inode.nlink == 0
            }
            Some(Node::Dir(_)) => true,
            None => false,
        };
        if remove {
            self.nodes.remove(&ino);
        }
    }

    /// Returns whether `ino` is `node` or one of its ancestors.
    fn is_ancestor(&self, ino: u64, node: u64) -> bool {
        let mut current = node;
        loop {
            if current == ino {
                return true;
            }
            match self.dir(current) {
                Ok(dir) if current != ROOT_INO => current = dir.parent,
                _ => return false,
            }
        }
    }

    fn stat(&self, ino: u64) -> Result<Stat> {
        match self.nodes.get(&ino) {
            Some(Node::File(inode)) => Ok(inode.lock().stat()),
            Some(Node::Dir(dir)) => {
                let subdirs = dir.entries.values().filter(|&&i| self.is_dir(i)).count();
                let nlink = u32::try_from(subdirs + 2).unwrap_or(u32::MAX);
                Ok(stat(
                    ino,
                    libc::S_IFDIR | dir.mode,
                    nlink,
                    BLOCK_SIZE as u64,
                    dir.mtime,
                ))
            }
            None => Err(ENOENT),
        }
    }
}

/// Storage shared by every instance of the enclave filesystem.
pub struct Volume {
    sealer: Arc<dyn Sealer>,
    tree: Mutex<Tree>,
}

impl Volume {
    pub fn new(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            sealer,
            tree: Mutex::new(Tree::new()),
        }
    }
}

/// The enclave filesystem template and its mounted instances.
pub(crate) struct EncFs {
    volume: Arc<Volume>,
    root: AtomicU64,
}

impl Clone for EncFs {
    fn clone(&self) -> Self {
        Self {
            volume: self.volume.clone(),
            root: AtomicU64::new(self.root()),
        }
    }
}

impl EncFs {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self {
            volume,
            root: AtomicU64::new(ROOT_INO),
        }
    }

    pub fn unmounted(&self) -> Self {
        Self::new(self.volume.clone())
    }

    fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    pub fn open(&self, path: &str, flags: c_int, mode: mode_t) -> Result<Device> {
        let access = flags & O_ACCMODE;
        if access == O_ACCMODE {
            return Err(EINVAL);
        }

        let mut tree = self.volume.tree.lock();
        let (parent, name) = tree.entry(self.root(), path)?;
        let existing = match name {
            "" => Some(parent),
            name => tree.child(parent, name),
        };

        let inode = match existing {
            Some(_) if flags & O_CREAT != 0 && flags & O_EXCL != 0 => return Err(EEXIST),
            Some(ino) => match tree.nodes.get(&ino) {
                Some(Node::File(_)) if flags & O_DIRECTORY != 0 => return Err(ENOTDIR),
                Some(Node::File(inode)) => inode.clone(),
                Some(Node::Dir(_)) => return Err(EISDIR),
                None => return Err(ENOENT),
            },
            None if flags & O_CREAT != 0 => {
                let inode = Arc::new(Mutex::new(Inode {
                    ino: tree.next,
                    mode: mode & 0o7777,
                    nlink: 1,
                    size: 0,
                    blocks: Vec::new(),
                    mtime: Time::now(),
                }));
                tree.insert(parent, name, Node::File(inode.clone()))?;
                inode
            }
            None => return Err(ENOENT),
        };
        drop(tree);

        if access != O_RDONLY && flags & O_TRUNC != 0 {
            inode.lock().resize(&*self.volume.sealer, 0)?;
        }
        let file = EncFile {
            handle: Arc::new(Handle {
                volume: self.volume.clone(),
                inode,
                flags,
                cursor: Mutex::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        Ok(Device::new(Backend::EncFile(file)))
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let tree = self.volume.tree.lock();
        let ino = tree.lookup(self.root(), path)?;
        tree.stat(ino)
    }

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        let mut tree = self.volume.tree.lock();
        let ino = tree.lookup(self.root(), old)?;
        let inode = match tree.nodes.get(&ino) {
            Some(Node::File(inode)) => inode.clone(),
            Some(Node::Dir(_)) => return Err(EPERM),
            None => return Err(ENOENT),
        };

        let (parent, name) = tree.entry(self.root(), new)?;
        let dir = tree.dir_mut(parent)?;
        if name.is_empty() || dir.entries.contains_key(name) {
            return Err(EEXIST);
        }
        dir.entries.insert(name.into(), ino);
        dir.mtime = Time::now();
        inode.lock().nlink += 1;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let mut tree = self.volume.tree.lock();
        let (parent, name) = tree.entry(self.root(), path)?;
        if name.is_empty() {
            return Err(EISDIR);
        }
        let ino = tree.child(parent, name).ok_or(ENOENT)?;
        if tree.is_dir(ino) {
            return Err(EISDIR);
        }
        tree.unlink_entry(parent, name)?;
        tree.drop_link(ino);
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut tree = self.volume.tree.lock();
        let (old_parent, old_name) = tree.entry(self.root(), old)?;
        let (new_parent, new_name) = tree.entry(self.root(), new)?;
        if old_name.is_empty() || new_name.is_empty() {
            return Err(EBUSY);
        }

        let ino = tree.child(old_parent, old_name).ok_or(ENOENT)?;
        let is_dir = tree.is_dir(ino);
        if is_dir && tree.is_ancestor(ino, new_parent) {
            return Err(EINVAL);
        }

        if let Some(target) = tree.child(new_parent, new_name) {
            if target == ino {
                return Ok(());
            }
            match (is_dir, tree.nodes.get(&target)) {
                (true, Some(Node::Dir(dir))) if !dir.entries.is_empty() => return Err(ENOTEMPTY),
                (true, Some(Node::File(_))) => return Err(ENOTDIR),
                (false, Some(Node::Dir(_))) => return Err(EISDIR),
                _ => {}
            }
            tree.unlink_entry(new_parent, new_name)?;
            tree.drop_link(target);
        }

        tree.unlink_entry(old_parent, old_name)?;
        let dir = tree.dir_mut(new_parent)?;
        dir.entries.insert(new_name.into(), ino);
        if let Some(Node::Dir(dir)) = tree.nodes.get_mut(&ino) {
            dir.parent = new_parent;
        }
        Ok(())
    }

    pub fn truncate(&self, path: &str, length: off_t) -> Result<()> {
        let length = u64::try_from(length).map_err(|_| EINVAL)?;
        let inode = {
            let tree = self.volume.tree.lock();
            let ino = tree.lookup(self.root(), path)?;
            match tree.nodes.get(&ino) {
                Some(Node::File(inode)) => inode.clone(),
                Some(Node::Dir(_)) => return Err(EISDIR),
                None => return Err(ENOENT),
            }
        };
        let mut inode = inode.lock();
        inode.resize(&*self.volume.sealer, length)
    }

    pub fn mkdir(&self, path: &str, mode: mode_t) -> Result<()> {
        let mut tree = self.volume.tree.lock();
        let (parent, name) = tree.entry(self.root(), path)?;
        if name.is_empty() || tree.child(parent, name).is_some() {
            return Err(EEXIST);
        }
        let dir = Directory {
            parent,
            mode: mode & 0o7777,
            entries: BTreeMap::new(),
            mtime: Time::now(),
        };
        tree.insert(parent, name, Node::Dir(dir))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut tree = self.volume.tree.lock();
        let (parent, name) = tree.entry(self.root(), path)?;
        if name.is_empty() {
            return Err(EBUSY);
        }
        let ino = tree.child(parent, name).ok_or(ENOENT)?;
        if !tree.dir(ino)?.entries.is_empty() {
            return Err(ENOTEMPTY);
        }
        tree.unlink_entry(parent, name)?;
        tree.drop_link(ino);
        Ok(())
    }

    pub fn opendir(&self, path: &str) -> Result<Device> {
        let tree = self.volume.tree.lock();
        let ino = tree.lookup(self.root(), path)?;
        let dir = tree.dir(ino)?;

        let kind = |ino: u64| match tree.is_dir(ino) {
            true => libc::DT_DIR,
            false => libc::DT_REG,
        };
        let parent = match ino == self.root() {
            true => ino,
            false => dir.parent,
        };
        let mut entries = vec![
            DirEntry {
                ino,
                kind: libc::DT_DIR,
                name: ".".into(),
            },
            DirEntry {
                ino: parent,
                kind: libc::DT_DIR,
                name: "..".into(),
            },
        ];
        entries.extend(dir.entries.iter().map(|(name, &ino)| DirEntry {
            ino,
            kind: kind(ino),
            name: name.clone(),
        }));

        let listing = Listing { entries, next: 0 };
        Ok(Device::new(Backend::EncDir(EncDir {
            listing: Arc::new(Mutex::new(Some(listing))),
        })))
    }

    /// Roots the instance at directory `source` of the volume.
    pub fn mount(&self, source: &str) -> Result<()> {
        let tree = self.volume.tree.lock();
        let ino = tree.lookup(ROOT_INO, source)?;
        tree.dir(ino)?;
        self.root.store(ino, Ordering::Release);
        Ok(())
    }

    pub fn unmount(&self) -> Result<()> {
        self.root.store(ROOT_INO, Ordering::Release);
        Ok(())
    }
}

struct Handle {
    volume: Arc<Volume>,
    inode: Arc<Mutex<Inode>>,
    flags: c_int,
    cursor: Mutex<u64>,
    closed: AtomicBool,
}

impl Handle {
    fn check(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => Err(EBADF),
            false => Ok(()),
        }
    }

    fn readable(&self) -> bool {
        self.flags & O_ACCMODE != O_WRONLY
    }

    fn writable(&self) -> bool {
        self.flags & O_ACCMODE != O_RDONLY
    }
}

/// An open enclave file.
#[derive(Clone)]
pub(crate) struct EncFile {
    handle: Arc<Handle>,
}

impl EncFile {
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let handle = &*self.handle;
        handle.check()?;
        if !handle.readable() {
            return Err(EBADF);
        }

        let mut cursor = handle.cursor.lock();
        let n = handle
            .inode
            .lock()
            .read_at(&*handle.volume.sealer, *cursor, buf)?;
        *cursor += n as u64;
        Ok(n)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let handle = &*self.handle;
        handle.check()?;
        if !handle.writable() {
            return Err(EBADF);
        }

        let mut cursor = handle.cursor.lock();
        let mut inode = handle.inode.lock();
        if handle.flags & O_APPEND != 0 {
            *cursor = inode.size;
        }
        let n = inode.write_at(&*handle.volume.sealer, *cursor, buf)?;
        *cursor += n as u64;
        Ok(n)
    }

    pub fn lseek(&self, offset: off_t, whence: c_int) -> Result<off_t> {
        let handle = &*self.handle;
        handle.check()?;

        let mut cursor = handle.cursor.lock();
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *cursor,
            SEEK_END => handle.inode.lock().size,
            _ => return Err(EINVAL),
        };
        let base = off_t::try_from(base).map_err(|_| EOVERFLOW)?;
        let pos = base.checked_add(offset).ok_or(EOVERFLOW)?;
        *cursor = u64::try_from(pos).map_err(|_| EINVAL)?;
        Ok(pos)
    }

    pub fn fstat(&self) -> Result<Stat> {
        self.handle.check()?;
        Ok(self.handle.inode.lock().stat())
    }

    pub fn ftruncate(&self, length: off_t) -> Result<()> {
        let handle = &*self.handle;
        handle.check()?;
        if !handle.writable() {
            return Err(EINVAL);
        }
        let length = u64::try_from(length).map_err(|_| EINVAL)?;
        handle.inode.lock().resize(&*handle.volume.sealer, length)
    }

    pub fn close(&self) -> Result<()> {
        match self.handle.closed.swap(true, Ordering::AcqRel) {
            true => Err(EBADF),
            false => Ok(()),
        }
    }
}

struct Listing {
    entries: Vec<DirEntry>,
    next: usize,
}

/// An open enclave directory, listing the entries present when it was opened.
#[derive(Clone)]
pub(crate) struct EncDir {
    listing: Arc<Mutex<Option<Listing>>>,
}

impl EncDir {
    pub fn readdir(&self) -> Result<Option<DirEntry>> {
        let mut listing = self.listing.lock();
        let listing = listing.as_mut().ok_or(EBADF)?;
        let entry = listing.entries.get(listing.next).cloned();
        if entry.is_some() {
            listing.next += 1;
        }
        Ok(entry)
    }

    pub fn closedir(&self) -> Result<()> {
        self.listing.lock().take().map(|_| ()).ok_or(EBADF)
    }

    pub fn close(&self) -> Result<()> {
        self.closedir()
    }
}
